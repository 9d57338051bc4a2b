//! Terminal implementations of the host prompts.

use std::io::{self, BufRead, Write};

use async_trait::async_trait;
use kernel_bridge::{KernelError, PasswordProvider, Prompt};

/// Numbered-choice prompt on stderr/stdin.
pub struct TerminalPrompt;

fn pick(options: &[&str], answer: &str) -> Option<String> {
    let answer = answer.trim();
    if let Ok(index) = answer.parse::<usize>() {
        return options.get(index.checked_sub(1)?).map(|o| o.to_string());
    }
    options
        .iter()
        .find(|o| o.eq_ignore_ascii_case(answer))
        .map(|o| o.to_string())
}

#[async_trait]
impl Prompt for TerminalPrompt {
    async fn show_warning_message(&self, message: &str, options: &[&str]) -> Option<String> {
        let message = message.to_string();
        let options: Vec<String> = options.iter().map(|o| o.to_string()).collect();
        tokio::task::spawn_blocking(move || {
            eprintln!("Warning: {}", message);
            for (i, option) in options.iter().enumerate() {
                eprintln!("  {}) {}", i + 1, option);
            }
            eprint!("> ");
            let _ = io::stderr().flush();
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line).ok()?;
            let options: Vec<&str> = options.iter().map(String::as_str).collect();
            pick(&options, &line)
        })
        .await
        .ok()
        .flatten()
    }
}

/// Reads a server password without echo. An empty answer means none.
pub struct TerminalPassword;

#[async_trait]
impl PasswordProvider for TerminalPassword {
    async fn password(&self, base_url: &str) -> Result<Option<String>, KernelError> {
        let base_url = base_url.to_string();
        let password = tokio::task::spawn_blocking(move || {
            eprint!("Password for {} (empty for none): ", base_url);
            let _ = io::stderr().flush();
            rpassword::read_password()
        })
        .await
        .map_err(|e| KernelError::Password(e.to_string()))?
        .map_err(|e| KernelError::Password(e.to_string()))?;
        Ok(Some(password).filter(|p| !p.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_by_number_or_name() {
        let options = ["Yes", "No", "Don't Ask Again"];
        assert_eq!(pick(&options, "1\n"), Some("Yes".to_string()));
        assert_eq!(pick(&options, "no"), Some("No".to_string()));
        assert_eq!(pick(&options, "0"), None);
        assert_eq!(pick(&options, "4"), None);
        assert_eq!(pick(&options, ""), None);
    }
}
