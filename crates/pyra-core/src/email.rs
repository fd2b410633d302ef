// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! Error emails.
//!
//! Two templates: "new exceptions" when the ledger gains items, and "all
//! resolved" when it drains. Both quote the last two iteration windows of
//! the core log, with config-update payload lines redacted.

use std::path::Path;

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::info;

use crate::config::ErrorEmailConfig;
use crate::error::{PyraError, Result};
use crate::state::ExceptionStateItem;

/// Marker each supervisor iteration logs; emails quote from the
/// second-to-last occurrence onward.
pub const ITERATION_MARKER: &str = "Starting iteration";

/// Lines containing this are never mailed out verbatim (they can carry
/// credentials from an operator's partial update).
const REDACTION_MARKER: &str = "config update";

const LOG_FILE_NAME: &str = "core.log";

fn config_error(reason: impl Into<String>) -> PyraError {
    PyraError::Config {
        reason: reason.into(),
    }
}

pub struct EmailClient {
    config: ErrorEmailConfig,
}

impl EmailClient {
    pub fn new(config: ErrorEmailConfig) -> Self {
        Self { config }
    }

    fn transport(&self) -> Result<SmtpTransport> {
        // 465 is implicit TLS, everything else is STARTTLS
        let builder = if self.config.smtp_port == 465 {
            SmtpTransport::relay(&self.config.smtp_host)
                .map_err(|e| config_error(format!("SMTP relay setup failed: {}", e)))?
        } else {
            SmtpTransport::starttls_relay(&self.config.smtp_host)
                .map_err(|e| config_error(format!("SMTP STARTTLS setup failed: {}", e)))?
        };
        Ok(builder
            .port(self.config.smtp_port)
            .credentials(Credentials::new(
                self.config.smtp_username.clone(),
                self.config.smtp_password.clone(),
            ))
            .build())
    }

    fn recipients(&self) -> Result<Vec<Mailbox>> {
        self.config
            .recipients
            .split(',')
            .map(str::trim)
            .filter(|address| !address.is_empty())
            .map(|address| {
                address
                    .parse()
                    .map_err(|e| config_error(format!("bad recipient '{}': {}", address, e)))
            })
            .collect()
    }

    fn send(&self, subject: &str, body: String) -> Result<()> {
        if !self.config.notify_recipients {
            info!(subject, "Email notifications disabled, skipping");
            return Ok(());
        }
        let sender: Mailbox = self
            .config
            .sender_address
            .parse()
            .map_err(|e| config_error(format!("bad sender address: {}", e)))?;
        let recipients = self.recipients()?;
        if recipients.is_empty() {
            return Err(config_error("no error-email recipients configured"));
        }

        let mut builder = Message::builder().from(sender).subject(subject);
        for recipient in recipients {
            builder = builder.to(recipient);
        }
        let message = builder
            .body(body)
            .map_err(|e| config_error(format!("cannot build email: {}", e)))?;

        self.transport()?
            .send(&message)
            .map_err(|e| PyraError::Runtime {
                details: format!("SMTP send failed: {}", e),
            })?;
        info!(subject, "Error email sent");
        Ok(())
    }

    /// Notify about fresh ledger items.
    pub fn send_new_exceptions(
        &self,
        station_id: &str,
        items: &[ExceptionStateItem],
        log_window: &str,
    ) -> Result<()> {
        let subject = format!("[Pyra {}] new exceptions on station {}", crate::VERSION, station_id);
        self.send(&subject, render_new_exceptions(items, log_window))
    }

    /// Operator-triggered probe of the SMTP channel.
    pub fn send_test(&self, station_id: &str) -> Result<()> {
        let subject = format!("[Pyra {}] test email from station {}", crate::VERSION, station_id);
        self.send(
            &subject,
            "This is a test email. The SMTP channel works.\n".to_string(),
        )
    }

    /// Notify that the ledger drained.
    pub fn send_all_resolved(&self, station_id: &str, log_window: &str) -> Result<()> {
        let subject = format!(
            "[Pyra {}] all exceptions resolved on station {}",
            crate::VERSION,
            station_id
        );
        self.send(&subject, render_all_resolved(log_window))
    }
}

pub(crate) fn render_new_exceptions(items: &[ExceptionStateItem], log_window: &str) -> String {
    let mut body = String::from("The following exceptions are active:\n\n");
    for item in items {
        body.push_str(&format!(
            "- [{}] {}: {}\n",
            item.origin, item.subject, item.details
        ));
    }
    body.push_str("\nRecent log window:\n\n");
    body.push_str(log_window);
    body.push_str(&format!("\n\n-- Pyra {}\n", crate::VERSION));
    body
}

pub(crate) fn render_all_resolved(log_window: &str) -> String {
    format!(
        "All previously reported exceptions are resolved.\n\nRecent log window:\n\n{}\n\n-- Pyra {}\n",
        log_window,
        crate::VERSION
    )
}

/// The log tail from the second-to-last iteration marker onward, with
/// sensitive lines redacted.
pub fn recent_log_window(logs_dir: &Path) -> String {
    let content = std::fs::read_to_string(logs_dir.join(LOG_FILE_NAME)).unwrap_or_default();
    extract_log_window(&content)
}

pub(crate) fn extract_log_window(content: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let marker_positions: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| line.contains(ITERATION_MARKER))
        .map(|(index, _)| index)
        .collect();
    let start = match marker_positions.len() {
        0 => lines.len().saturating_sub(50), // no markers yet: plain tail
        1 => marker_positions[0],
        n => marker_positions[n - 2],
    };
    lines[start..]
        .iter()
        .map(|line| {
            if line.to_lowercase().contains(REDACTION_MARKER) {
                "<line redacted>".to_string()
            } else {
                (*line).to_string()
            }
        })
        .collect::<Vec<String>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_log_window_two_iterations() {
        let content = "\
old noise
Starting iteration 41
step a
Starting iteration 42
step b
Starting iteration 43
step c";
        let window = extract_log_window(content);
        assert!(window.starts_with("Starting iteration 42"));
        assert!(window.contains("step c"));
        assert!(!window.contains("step a"));
        assert!(!window.contains("old noise"));
    }

    #[test]
    fn test_extract_log_window_redacts_payload_lines() {
        let content = "\
Starting iteration 1
Applying config update {\"opus\": {\"password\": \"hunter2\"}}
done";
        let window = extract_log_window(content);
        assert!(!window.contains("hunter2"));
        assert!(window.contains("<line redacted>"));
        assert!(window.contains("done"));
    }

    #[test]
    fn test_extract_log_window_without_markers_takes_tail() {
        let content = "a\nb\nc";
        assert_eq!(extract_log_window(content), "a\nb\nc");
    }

    #[test]
    fn test_render_new_exceptions_lists_items() {
        let items = vec![ExceptionStateItem {
            origin: "opus".to_string(),
            subject: "spectrometer-error".to_string(),
            details: "EM27 unreachable".to_string(),
            send_emails: true,
        }];
        let body = render_new_exceptions(&items, "log tail");
        assert!(body.contains("[opus] spectrometer-error: EM27 unreachable"));
        assert!(body.contains("log tail"));
        assert!(body.contains(crate::VERSION));
    }

    #[test]
    fn test_disabled_notifications_do_not_send() {
        let client = EmailClient::new(ErrorEmailConfig {
            smtp_host: "smtp.example.org".to_string(),
            smtp_port: 587,
            smtp_username: "u".to_string(),
            smtp_password: "p".to_string(),
            sender_address: "pyra@example.org".to_string(),
            notify_recipients: false,
            recipients: "ops@example.org".to_string(),
        });
        // never reaches the network
        client.send("subject", "body".to_string()).unwrap();
    }
}
