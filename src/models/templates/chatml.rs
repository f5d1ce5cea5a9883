// ChatML template (Qwen family)

use super::ChatTemplate;

pub struct ChatMlTemplate;

const ASSISTANT_HEADER: &str = "<|im_start|>assistant\n";

impl ChatTemplate for ChatMlTemplate {
    fn format_example(&self, prompt: &str, output: &str) -> String {
        format!(
            "<|im_start|>user\n{}<|im_end|>\n{}{}<|im_end|>",
            prompt, ASSISTANT_HEADER, output
        )
    }

    fn format_chat_prompt(&self, system: &str, user_message: &str) -> String {
        format!(
            "<|im_start|>system\n{}<|im_end|>\n<|im_start|>user\n{}<|im_end|>\n{}",
            system, user_message, ASSISTANT_HEADER
        )
    }

    fn eos_token(&self) -> &'static str {
        "<|im_end|>"
    }

    fn clean_output(&self, raw_output: &str) -> String {
        let mut cleaned = raw_output;

        if let Some(start) = cleaned.rfind(ASSISTANT_HEADER) {
            cleaned = &cleaned[start + ASSISTANT_HEADER.len()..];
        }

        cleaned
            .split("<|im_end|>")
            .next()
            .unwrap_or(cleaned)
            .split("<|endoftext|>")
            .next()
            .unwrap_or(cleaned)
            .trim()
            .to_string()
    }

    fn family_name(&self) -> &'static str {
        "Qwen"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_segments() {
        let text = ChatMlTemplate.format_example("Explain gas", "Fees paid per operation.");
        assert_eq!(text.matches("<|im_start|>user").count(), 1);
        assert_eq!(text.matches("<|im_start|>assistant").count(), 1);
        assert!(text.ends_with("Fees paid per operation.<|im_end|>"));
    }

    #[test]
    fn test_chat_prompt_ends_at_assistant() {
        let prompt = ChatMlTemplate.format_chat_prompt("sys", "hi");
        assert!(prompt.contains("<|im_start|>system\nsys<|im_end|>"));
        assert!(prompt.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn test_clean_output() {
        assert_eq!(ChatMlTemplate.clean_output("The answer is 4<|im_end|>"), "The answer is 4");
        assert_eq!(
            ChatMlTemplate.clean_output("Response here<|im_end|>extra<|endoftext|>"),
            "Response here"
        );
    }
}
