//! Rendering of Hugging Face chat templates.
//!
//! Tokenizer configs ship their prompt format as a Jinja template. These are
//! written against Python's Jinja, so a handful of Python idioms are patched
//! into their MiniJinja equivalents before compiling.

use super::message::Message;
use minijinja::{context, Environment, UndefinedBehavior};
use minijinja_contrib::pycompat;

const TEMPLATE_NAME: &str = "chat";

/// A compiled chat template.
#[derive(Debug)]
pub struct ChatTemplate {
    env: Environment<'static>,
}

impl ChatTemplate {
    /// Compile a chat template from its Jinja source.
    pub fn new(source: &str) -> anyhow::Result<Self> {
        let source = source
            .replace("messages[::-1]", "messages|reverse")
            .replace("messages[-1]", "messages[(messages|length - 1)]");

        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Lenient);
        env.set_unknown_method_callback(pycompat::unknown_method_callback);
        env.add_filter("tojson", minijinja::filters::tojson);
        env.add_function("raise_exception", |msg: String| -> Result<(), minijinja::Error> {
            Err(minijinja::Error::new(
                minijinja::ErrorKind::InvalidOperation,
                msg,
            ))
        });
        env.add_template_owned(TEMPLATE_NAME, source)?;

        Ok(Self { env })
    }

    /// Render `messages` into a prompt string that ends with the assistant
    /// turn opener, ready for generation.
    pub fn render(&self, messages: &[Message]) -> anyhow::Result<String> {
        let rendered = self.env.get_template(TEMPLATE_NAME)?.render(context! {
            messages => messages,
            add_generation_prompt => true,
        })?;
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHATML: &str = "{% if messages[0]['role'] != 'system' %}<|im_start|>system\nYou are Qwen.<|im_end|>\n{% endif %}\
{% for message in messages %}<|im_start|>{{ message.role }}\n{{ message.content }}<|im_end|>\n{% endfor %}\
{% if add_generation_prompt %}<|im_start|>assistant\n{% endif %}";

    #[test]
    fn test_renders_generation_prompt() {
        let template = ChatTemplate::new(CHATML).unwrap();
        let prompt = template
            .render(&[
                Message::system("You are a helpful assistant"),
                Message::user("Hi"),
            ])
            .unwrap();

        assert_eq!(
            prompt,
            "<|im_start|>system\nYou are a helpful assistant<|im_end|>\n\
             <|im_start|>user\nHi<|im_end|>\n\
             <|im_start|>assistant\n"
        );
    }

    #[test]
    fn test_default_system_prompt_branch() {
        let template = ChatTemplate::new(CHATML).unwrap();
        let prompt = template.render(&[Message::user("Hi")]).unwrap();
        assert!(prompt.starts_with("<|im_start|>system\nYou are Qwen.<|im_end|>\n"));
    }

    #[test]
    fn test_python_reverse_slice_is_patched() {
        let template =
            ChatTemplate::new("{% for m in messages[::-1] %}{{ m.content }}{% endfor %}").unwrap();
        let out = template
            .render(&[Message::user("a"), Message::user("b")])
            .unwrap();
        assert_eq!(out, "ba");
    }

    #[test]
    fn test_invalid_template_is_an_error() {
        assert!(ChatTemplate::new("{% for %}").is_err());
    }
}
