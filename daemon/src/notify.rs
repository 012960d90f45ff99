// Copyright 2025 Oxide Computer Company

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{anyhow, bail, Result};
use slog::{info, Logger};

use crate::ownership::Verification;

/// Mail transports cap the subject header; truncate rather than let the
/// MTA reject the whole message.
const MAX_SUBJECT_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub body: String,
}

impl Notification {
    pub fn new(subject: &str, body: String) -> Notification {
        let mut subject = subject.to_string();
        if subject.len() > MAX_SUBJECT_LEN {
            /*
             * Cut on a char boundary at or below the cap.
             */
            let mut end = MAX_SUBJECT_LEN;
            while !subject.is_char_boundary(end) {
                end -= 1;
            }
            subject.truncate(end);
        }
        Notification { subject, body }
    }
}

pub trait Mailer: Send + Sync {
    fn send(&self, notification: &Notification) -> Result<()>;
}

/**
 * Delivers through the local sendmail(8), the way every box with an MTA
 * expects unattended mail to be sent.
 */
pub struct SendmailMailer {
    log: Logger,
    recipient: String,
}

impl SendmailMailer {
    pub fn new(log: Logger, recipient: &str) -> SendmailMailer {
        SendmailMailer {
            log,
            recipient: recipient.to_string(),
        }
    }
}

impl Mailer for SendmailMailer {
    fn send(&self, notification: &Notification) -> Result<()> {
        let mut child = Command::new("sendmail")
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| anyhow!("cannot spawn sendmail: {}", e))?;

        let message = format!(
            "To: {}\nSubject: {}\n\n{}\n",
            self.recipient, notification.subject, notification.body
        );
        child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("no stdin for sendmail"))?
            .write_all(message.as_bytes())?;

        let status = child.wait()?;
        if !status.success() {
            bail!("sendmail exited with {}", status);
        }
        info!(
            self.log,
            "sent notification to {}: {:?}",
            self.recipient,
            notification.subject
        );
        Ok(())
    }
}

pub fn hostname() -> String {
    Command::new("hostname")
        .output()
        .ok()
        .filter(|out| out.status.success())
        .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/**
 * Notification for drives that stopped verifying this cycle.  Each
 * entry carries the reason the verification produced.
 */
pub fn drives_missing(
    missing: &[(&Path, Verification)],
) -> Notification {
    let host = hostname();
    let names: Vec<String> = missing
        .iter()
        .map(|(p, _)| p.display().to_string())
        .collect();

    let mut body = String::new();
    body.push_str(
        "The following pool drives failed verification and have been \
         put aside:\n\n",
    );
    for (path, why) in missing {
        body.push_str(&format!("  {} ({})\n", path.display(), why.describe()));
    }
    body.push_str(
        "\nFile copies that lived on these drives will not be re-created \
         while the drives are in this state, to avoid churning if they \
         come back.\n\n\
         If a drive is gone for good, remove it from the pool:\n\n\
           hoardd gone <drive>\n\n\
         If it will come back after maintenance, wait for it:\n\n\
           hoardd wait-for <drive>\n\n\
         If the mount now holds a different (replacement) volume:\n\n\
           hoardd replace <drive>\n",
    );

    Notification::new(
        &format!(
            "[hoard] Storage drives gone from the pool on {}: {}",
            host,
            names.join(", ")
        ),
        body,
    )
}

/**
 * Notification for drives that verified again after being gone.
 */
pub fn drives_returned(returned: &[&Path]) -> Notification {
    let host = hostname();
    let names: Vec<String> =
        returned.iter().map(|p| p.display().to_string()).collect();

    let mut body = String::new();
    body.push_str(
        "The following pool drives have re-appeared and verified \
         correctly:\n\n",
    );
    for path in returned {
        body.push_str(&format!("  {}\n", path.display()));
    }
    body.push_str(
        "\nA consistency check has been scheduled to reconcile file \
         copies that changed while they were away.  No action is \
         needed.\n",
    );

    Notification::new(
        &format!(
            "[hoard] Storage drives returned to the pool on {}: {}",
            host,
            names.join(", ")
        ),
        body,
    )
}

#[cfg(test)]
pub struct RecordingMailer {
    pub sent: std::sync::Mutex<Vec<Notification>>,
}

#[cfg(test)]
impl RecordingMailer {
    pub fn new() -> RecordingMailer {
        RecordingMailer {
            sent: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn subjects(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.subject.clone())
            .collect()
    }
}

#[cfg(test)]
impl Mailer for RecordingMailer {
    fn send(&self, notification: &Notification) -> Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn subject_truncated_at_cap() {
        let long = "x".repeat(400);
        let n = Notification::new(&long, String::new());
        assert_eq!(n.subject.len(), MAX_SUBJECT_LEN);

        // Multi-byte chars are cut on a boundary, never mid-char.
        let wide = "é".repeat(200);
        let n = Notification::new(&wide, String::new());
        assert!(n.subject.len() <= MAX_SUBJECT_LEN);
        assert!(n.subject.is_char_boundary(n.subject.len()));

        let short = "short".to_string();
        let n = Notification::new(&short, String::new());
        assert_eq!(n.subject, "short");
    }

    #[test]
    fn missing_body_lists_reasons_and_remedies() {
        let drive = PathBuf::from("/mnt/hdd3");
        let n = drives_missing(&[(
            &drive,
            Verification::UuidMismatch {
                expected: "aaaa".to_string(),
                current: Some("bbbb".to_string()),
            },
        )]);

        assert!(n.subject.contains("/mnt/hdd3"));
        assert!(n.body.contains("expected partition UUID: aaaa"));
        assert!(n.body.contains("current partition UUID: bbbb"));
        assert!(n.body.contains("hoardd gone"));
        assert!(n.body.contains("hoardd wait-for"));
        assert!(n.body.contains("hoardd replace"));
    }

    #[test]
    fn returned_body_names_drives() {
        let a = PathBuf::from("/mnt/hdd1");
        let b = PathBuf::from("/mnt/hdd2");
        let n = drives_returned(&[&a, &b]);
        assert!(n.subject.contains("/mnt/hdd1"));
        assert!(n.body.contains("/mnt/hdd2"));
    }
}
