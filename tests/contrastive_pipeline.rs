// End-to-end tests against real Qwen2.5-Coder checkpoints.
// These download weights from the Hugging Face Hub; run with `cargo test -- --ignored`.

use contrastive_decoding::pipelines::contrastive::*;
use contrastive_decoding::{
    CancellationToken, DecodingConfig, DecodingError, Message, Qwen2Model, Qwen2Size, StopReason,
};
use futures::StreamExt;

async fn small_pipeline(max_tokens: usize) -> anyhow::Result<ContrastivePipeline<Qwen2Model>> {
    ContrastivePipelineBuilder::qwen2_coder(Qwen2Size::Coder0_5B, Qwen2Size::Coder0_5B)
        .weight(0.5)
        .max_tokens(max_tokens)
        .cpu()
        .build()
        .await
}

#[tokio::test]
#[ignore]
async fn basic_contrastive_completion() -> anyhow::Result<()> {
    let pipeline = ContrastivePipelineBuilder::<Qwen2Model>::default()
        .max_tokens(24)
        .cpu()
        .build()
        .await?;

    let messages = vec![
        Message::system("You are a helpful assistant"),
        Message::user("Give a one line docstring for: fn add(a: i32, b: i32) -> i32 { a + b }"),
    ];
    let out = pipeline.completion(&messages).await?;
    assert!(!out.trim().is_empty());
    assert!(!out.contains("<|im_end|>"));
    Ok(())
}

#[tokio::test]
#[ignore]
async fn generation_respects_budget() -> anyhow::Result<()> {
    let pipeline = small_pipeline(5).await?;
    let prompt = pipeline.prompt_tokens(Input::Prompt("Count to one hundred:"))?;

    let result = pipeline.generate_tokens(&prompt)?;
    assert!(result.tokens.len() <= 5);
    if result.stop_reason == StopReason::BudgetExhausted {
        assert_eq!(result.tokens.len(), 5);
    }
    Ok(())
}

#[tokio::test]
#[ignore]
async fn generation_is_deterministic() -> anyhow::Result<()> {
    let pipeline = small_pipeline(8).await?;
    let first = pipeline.completion("Rust is a").await?;
    let second = pipeline.completion("Rust is a").await?;
    assert_eq!(first, second);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn streaming_matches_completion() -> anyhow::Result<()> {
    let pipeline = small_pipeline(12).await?;

    let full = pipeline.completion("Write a haiku about borrowing").await?;
    let mut stream = pipeline.completion_stream("Write a haiku about borrowing")?;
    let mut acc = String::new();
    while let Some(chunk) = stream.next().await {
        acc.push_str(&chunk?);
    }
    assert_eq!(acc, full);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn zero_weight_matches_expert_greedy_decoding() -> anyhow::Result<()> {
    let mut pipeline = small_pipeline(8).await?;
    let prompt = pipeline.prompt_tokens(Input::Prompt("fn main() {"))?;

    let config = pipeline.decoding_config().to_builder().weight(0.0).build()?;
    pipeline.set_decoding_config(config.clone());
    let contrastive = pipeline.generate_tokens(&prompt)?;

    let mut expert = ContextSource::new(pipeline.expert().new_context());
    let greedy = contrastive_decoding::greedy(&prompt, &mut expert, &config)?;
    assert_eq!(contrastive.tokens, greedy.tokens);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn cancelled_completion_returns_error() -> anyhow::Result<()> {
    let pipeline = small_pipeline(64).await?;
    let token = CancellationToken::new();
    token.cancel();

    let err = pipeline
        .completion_with_cancellation("Hello", &token)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DecodingError>(),
        Some(DecodingError::Cancelled { steps: 0 })
    ));
    Ok(())
}

#[tokio::test]
#[ignore]
async fn explicit_config_roundtrips_through_pipeline() -> anyhow::Result<()> {
    let mut pipeline = small_pipeline(4).await?;
    let config = DecodingConfig::builder()
        .weight(0.25)
        .max_tokens(3)
        .build()?;
    pipeline.set_decoding_config(config.clone());
    assert_eq!(pipeline.decoding_config(), &config);

    let prompt = pipeline.prompt_tokens(Input::Prompt("Hi"))?;
    let result = pipeline.generate_tokens(&prompt)?;
    assert_eq!(result.tokens.len(), 3);
    Ok(())
}
