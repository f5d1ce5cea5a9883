// Llama 3 header template

use super::ChatTemplate;

pub struct Llama3Template;

const END_HEADER: &str = "<|end_header_id|>";

impl ChatTemplate for Llama3Template {
    fn format_example(&self, prompt: &str, output: &str) -> String {
        format!(
            "<|begin_of_text|><|start_header_id|>user{h}\n\n{}<|eot_id|>\
             <|start_header_id|>assistant{h}\n\n{}<|eot_id|>",
            prompt,
            output,
            h = END_HEADER
        )
    }

    fn format_chat_prompt(&self, system: &str, user_message: &str) -> String {
        format!(
            "<|begin_of_text|><|start_header_id|>system{h}\n\n{}<|eot_id|>\
             <|start_header_id|>user{h}\n\n{}<|eot_id|>\
             <|start_header_id|>assistant{h}\n\n",
            system,
            user_message,
            h = END_HEADER
        )
    }

    fn eos_token(&self) -> &'static str {
        "<|eot_id|>"
    }

    fn clean_output(&self, raw_output: &str) -> String {
        let cleaned = raw_output
            .split("<|eot_id|>")
            .next()
            .unwrap_or(raw_output)
            .split("<|end_of_text|>")
            .next()
            .unwrap_or(raw_output)
            .trim();

        if cleaned.starts_with("<|start_header_id|>") {
            if let Some(pos) = cleaned.find(END_HEADER) {
                return cleaned[pos + END_HEADER.len()..].trim().to_string();
            }
        }
        cleaned.to_string()
    }

    fn family_name(&self) -> &'static str {
        "Llama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_segments() {
        let text = Llama3Template.format_example("Define MEV", "Value extracted by ordering.");
        assert!(text.starts_with("<|begin_of_text|>"));
        assert_eq!(text.matches("<|start_header_id|>user").count(), 1);
        assert_eq!(text.matches("<|start_header_id|>assistant").count(), 1);
    }

    #[test]
    fn test_clean_output() {
        assert_eq!(Llama3Template.clean_output("Four.<|eot_id|>"), "Four.");
        assert_eq!(
            Llama3Template.clean_output("<|start_header_id|>assistant<|end_header_id|>\n\nFour."),
            "Four."
        );
    }
}
