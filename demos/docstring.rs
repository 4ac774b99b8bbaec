//! Writes a docstring for a JavaScript function by contrasting
//! Qwen2.5-Coder 1.5B (expert) with Qwen2.5-Coder 0.5B (amateur).
//!
//! `RUST_LOG=contrastive_decoding=debug cargo run --release --example docstring -- --stream`

use contrastive_decoding::{ContrastivePipelineBuilder, Message, Qwen2Size};
use futures::StreamExt;
use std::io::Write;
use tracing_subscriber::EnvFilter;

const FUNCTION: &str = r#"function updateEloScores(
	scores,
	results,
	kFactor = 4,
) {
	for (const result of results) {
		const { first, second, outcome } = result;
		const firstScore = scores[first] ?? 1000;
		const secondScore = scores[second] ?? 1000;

		const expectedScoreFirst = 1 / (1 + Math.pow(10, (secondScore - firstScore) / 400));
		const expectedScoreSecond = 1 / (1 + Math.pow(10, (firstScore - secondScore) / 400));
		let sa = 0.5;
		if (outcome === 1) {
			sa = 1;
		} else if (outcome === -1) {
			sa = 0;
		}
		scores[first] = firstScore + kFactor * (sa - expectedScoreFirst);
		scores[second] = secondScore + kFactor * (1 - sa - expectedScoreSecond);
	}
	return scores;
}"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let stream = std::env::args().any(|arg| arg == "--stream");

    let pipeline =
        ContrastivePipelineBuilder::qwen2_coder(Qwen2Size::Coder1_5B, Qwen2Size::Coder0_5B)
            .weight(0.5)
            .max_tokens(1000)
            .build()
            .await?;

    let messages = vec![
        Message::system("You are a helpful assistant"),
        Message::user(format!(
            "Give a very very brief docstring for the following function:\n```\n{FUNCTION}\n```"
        )),
    ];

    println!("Contrastive decoding output:");
    if stream {
        let mut chunks = pipeline.completion_stream(&messages)?;
        let mut stdout = std::io::stdout();
        while let Some(chunk) = chunks.next().await {
            write!(stdout, "{}", chunk?)?;
            stdout.flush()?;
        }
        println!();
    } else {
        println!("{}", pipeline.completion(&messages).await?);
    }

    Ok(())
}
