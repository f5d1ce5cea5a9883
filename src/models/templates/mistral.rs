// Mistral template
//
// Instruction-delimiter format used by Mistral 7B and its fine-tunes.

use super::ChatTemplate;

pub struct MistralTemplate;

impl ChatTemplate for MistralTemplate {
    fn format_example(&self, prompt: &str, output: &str) -> String {
        format!("<s>[INST] {} [/INST] {}</s>", prompt, output)
    }

    fn format_chat_prompt(&self, system: &str, user_message: &str) -> String {
        // No system role; the system text leads the first instruction
        if system.trim().is_empty() {
            format!("<s>[INST] {} [/INST]", user_message)
        } else {
            format!("<s>[INST] {}\n\n{} [/INST]", system, user_message)
        }
    }

    fn eos_token(&self) -> &'static str {
        "</s>"
    }

    fn clean_output(&self, raw_output: &str) -> String {
        let cleaned = raw_output
            .split("</s>")
            .next()
            .unwrap_or(raw_output)
            .split("[/INST]")
            .last()
            .unwrap_or(raw_output)
            .trim();

        cleaned
            .trim_start_matches("<s>")
            .trim_start()
            .trim_start_matches("[INST]")
            .trim()
            .to_string()
    }

    fn family_name(&self) -> &'static str {
        "Mistral"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_has_one_instruction_and_one_response() {
        let text = MistralTemplate.format_example("What is TVL?", "Total value locked.");
        assert_eq!(text, "<s>[INST] What is TVL? [/INST] Total value locked.</s>");
        assert_eq!(text.matches("[INST]").count(), 1);
        assert_eq!(text.matches("[/INST]").count(), 1);
        assert!(text.ends_with("</s>"));
    }

    #[test]
    fn test_chat_prompt() {
        let prompt = MistralTemplate.format_chat_prompt("Be brief.", "What is 2+2?");
        assert!(prompt.starts_with("<s>[INST] Be brief."));
        assert!(prompt.ends_with("What is 2+2? [/INST]"));
    }

    #[test]
    fn test_clean_output() {
        assert_eq!(MistralTemplate.clean_output("The answer is 4</s>"), "The answer is 4");
        assert_eq!(
            MistralTemplate.clean_output("[INST] echo [/INST] The answer is 4"),
            "The answer is 4"
        );
        assert_eq!(MistralTemplate.clean_output("Just a response"), "Just a response");
    }
}
