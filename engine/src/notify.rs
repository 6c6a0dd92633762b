//! Notifications.
//!
//! A finished run is rendered into a mail message from a template with
//! `${name}` placeholders. Delivery is left to a [`MailSender`]; the crate only
//! ships [`StandardSender`], which prints messages for the `TEST` mail host.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use thiserror::Error;

use crate::config::{MailConfig, NotifyPolicy};
use crate::model::{FileRecord, FileTags, JobResult};

/// Mail host that prints messages instead of sending them.
pub const TEST_MAIL_HOST: &str = "TEST";

pub const DEFAULT_SUBJECT: &str = "Job \"${jobname}\" finished [${status}]";

pub const DEFAULT_TEMPLATE: &str = "\
Job \"${jobname}\" (ID: ${jobid}) on ${host}:

Start: ${starttime}
End: ${endtime}
Duration: ${duration}

Info:
${info}

Logfile: ${logfile}

${message}

Source: ${source}
Target: ${target}

Files: (= is transferred, > is source error, < is target error, ~ is not post-processed)
${file_list}
";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Placeholder for values that are not known.
const NONE: &str = "-";

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{(\w+)\}").expect("Invalid placeholder regex"))
}

#[derive(Debug, Error)]
pub enum NotifyError {
    /// A transport rejected the message
    #[error("cannot deliver notification via {host}: {reason}")]
    Delivery { host: String, reason: String },

    #[error("no mail transport for host {host}")]
    Unsupported { host: String },
}

/// A rendered notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "From: {}", self.from)?;
        writeln!(f, "To: {}", self.to.join(", "))?;
        writeln!(f, "Subject: {}", self.subject)?;
        writeln!(f)?;
        write!(f, "{}", self.body)
    }
}

/// Delivers rendered messages.
pub trait MailSender {
    fn send(&self, mail: &MailConfig, message: &Message) -> Result<(), NotifyError>;
}

/// Prints messages for the `TEST` host; other hosts have no transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardSender;

impl MailSender for StandardSender {
    fn send(&self, mail: &MailConfig, message: &Message) -> Result<(), NotifyError> {
        if mail.host == TEST_MAIL_HOST {
            println!("=====\n{}\n=====", message);
            Ok(())
        } else {
            Err(NotifyError::Unsupported {
                host: format!("{}:{}", mail.host, mail.port),
            })
        }
    }
}

fn format_duration(d: chrono::Duration) -> String {
    let secs = d.num_seconds().max(0);
    format!("{}:{:02}:{:02}", secs / 3600, secs % 3600 / 60, secs % 60)
}

fn format_file_list(list: Option<&[FileRecord]>) -> String {
    match list {
        None => " no data collected".to_string(),
        Some([]) => " no data".to_string(),
        Some(records) => records
            .iter()
            .map(|r| format!(" {} {} ({})", r.mark, r.path, r.info))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// All placeholder values for a result: the run's tags plus values derived
/// from the result itself. Derived values win over tags of the same name.
pub fn placeholder_values(result: &JobResult, tags: &FileTags) -> BTreeMap<String, String> {
    let mut values: BTreeMap<String, String> = ["jobname", "info", "host", "source", "target", "logfile"]
        .iter()
        .map(|k| (k.to_string(), NONE.to_string()))
        .collect();
    values.extend(tags.iter().map(|(k, v)| (k.to_string(), v.to_string())));

    let summary = format!(
        "{} files transferred, {} source errors, {} target errors",
        result.files_cnt(),
        result.src_error_cnt(),
        result.tgt_error_cnt()
    );
    let message = match result.error_message() {
        Some(err) => format!("{}:\n {}", summary, err),
        None => summary,
    };
    let derived = [
        ("jobid", result.job_id().to_string()),
        ("starttime", result.start_time().format(TIME_FORMAT).to_string()),
        ("endtime", result.end_time().format(TIME_FORMAT).to_string()),
        ("duration", format_duration(result.duration())),
        ("files", result.files_cnt().to_string()),
        ("srcerrors", result.src_error_cnt().to_string()),
        ("tgterrors", result.tgt_error_cnt().to_string()),
        ("status", result.status().to_string()),
        ("status_text", result.status().description().to_string()),
        ("message", message),
        ("error", result.error_message().unwrap_or(NONE).to_string()),
        ("stacktrace", result.stack_trace().unwrap_or(NONE).to_string()),
        ("file_list", format_file_list(result.file_list())),
    ];
    values.extend(derived.into_iter().map(|(k, v)| (k.to_string(), v)));
    values
}

/// Substitute placeholders in `template`. Unknown placeholders are kept as written.
pub fn render(result: &JobResult, tags: &FileTags, template: &str) -> String {
    let values = placeholder_values(result, tags);
    substitute(template, &values)
}

fn substitute(template: &str, values: &BTreeMap<String, String>) -> String {
    placeholder_regex()
        .replace_all(template, |caps: &Captures<'_>| match values.get(&caps[1]) {
            Some(v) => v.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Render the complete message for `mail`.
pub fn compose(result: &JobResult, tags: &FileTags, mail: &MailConfig) -> Message {
    let values = placeholder_values(result, tags);
    Message {
        from: mail.from.clone(),
        to: mail.to.clone(),
        subject: substitute(mail.subject.as_deref().unwrap_or(DEFAULT_SUBJECT), &values),
        body: substitute(mail.template.as_deref().unwrap_or(DEFAULT_TEMPLATE), &values),
    }
}

/// Renders and sends at most one message per run, as the policy asks.
pub struct Dispatcher<'a> {
    sender: &'a dyn MailSender,
}

impl<'a> Dispatcher<'a> {
    pub fn new(sender: &'a dyn MailSender) -> Self {
        Dispatcher { sender }
    }

    /// Notify about `result` if the policy wants it.
    ///
    /// Returns the message that was handed to the sender. Delivery failures
    /// are logged, they never change the result.
    pub fn dispatch(
        &self,
        policy: &NotifyPolicy,
        result: &JobResult,
        tags: &FileTags,
    ) -> Option<Message> {
        let mail = match &policy.mail {
            Some(mail) if policy.wants(result.status()) => mail,
            _ => {
                tracing::debug!("no notification for status {}", result.status());
                return None;
            }
        };
        if mail.to.is_empty() {
            tracing::warn!("no recipients in mail config {}", mail.name);
            return None;
        }
        let message = compose(result, tags, mail);
        match self.sender.send(mail, &message) {
            Ok(()) => tracing::info!("notification sent to {}", mail.to.join(", ")),
            Err(e) => tracing::error!("notification not sent: {}", e),
        }
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use crate::model::{FileMark, Status};
    use chrono::{Local, TimeZone};
    use std::cell::RefCell;

    fn sample_result() -> JobResult {
        let start = Local.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let end = Local.with_ymd_and_hms(2024, 5, 1, 10, 1, 5).unwrap();
        JobResult::new(
            "job7".to_string(),
            Status::Error,
            start,
            end,
            2,
            1,
            0,
            None,
            None,
            Some(vec![FileRecord {
                path: "a.txt".to_string(),
                info: "0.01s".to_string(),
                mark: FileMark::Transferred,
            }]),
        )
    }

    fn sample_tags() -> FileTags {
        let mut tags = FileTags::new();
        tags.insert("jobname", "Nightly");
        tags.insert("source", "local:///in");
        tags
    }

    fn mail() -> MailConfig {
        MailConfig {
            name: "default".to_string(),
            from: "ft@example.com".to_string(),
            to: vec!["ops@example.com".to_string()],
            host: TEST_MAIL_HOST.to_string(),
            port: 25,
            subject: None,
            template: None,
        }
    }

    #[derive(Default)]
    struct Recording {
        sent: RefCell<Vec<Message>>,
    }

    impl MailSender for Recording {
        fn send(&self, _mail: &MailConfig, message: &Message) -> Result<(), NotifyError> {
            self.sent.borrow_mut().push(message.clone());
            Ok(())
        }
    }

    #[test]
    fn test_render_known_and_unknown_placeholders() {
        let text = render(
            &sample_result(),
            &sample_tags(),
            "${jobid} ${jobname} ${files}/${srcerrors}/${tgterrors} ${status} ${duration} ${bogus} ${logfile}",
        );
        assert_eq!(text, "job7 Nightly 2/1/0 ERROR 0:01:05 ${bogus} -");
    }

    #[test]
    fn test_render_is_idempotent() {
        let result = sample_result();
        let tags = sample_tags();
        let first = render(&result, &tags, DEFAULT_TEMPLATE);
        let second = render(&result, &tags, DEFAULT_TEMPLATE);
        assert_eq!(first, second);
        assert!(first.contains(" = a.txt (0.01s)"));
    }

    #[test]
    fn test_values_are_not_expanded_again() {
        let mut tags = FileTags::new();
        tags.insert("info", "${jobid}");
        let text = render(&sample_result(), &tags, "${info}");
        assert_eq!(text, "${jobid}");
    }

    #[test]
    fn test_compose_uses_default_subject() {
        let message = compose(&sample_result(), &sample_tags(), &mail());
        assert_eq!(message.subject, "Job \"Nightly\" finished [ERROR]");
        assert_eq!(message.to, vec!["ops@example.com".to_string()]);
    }

    #[test]
    fn test_dispatch_follows_policy() {
        let sender = Recording::default();
        let dispatcher = Dispatcher::new(&sender);
        let mut policy = NotifyPolicy {
            on: vec![Status::Failure],
            mail: Some(mail()),
        };
        assert!(dispatcher
            .dispatch(&policy, &sample_result(), &sample_tags())
            .is_none());
        policy.on.push(Status::Error);
        assert!(dispatcher
            .dispatch(&policy, &sample_result(), &sample_tags())
            .is_some());
        assert_eq!(sender.sent.borrow().len(), 1);
    }

    struct Refusing;

    impl MailSender for Refusing {
        fn send(&self, mail: &MailConfig, _message: &Message) -> Result<(), NotifyError> {
            Err(NotifyError::Delivery {
                host: mail.host.clone(),
                reason: "relay denied".to_string(),
            })
        }
    }

    #[test]
    fn test_delivery_failure_still_returns_message() {
        let policy = NotifyPolicy {
            on: vec![Status::Error],
            mail: Some(mail()),
        };
        let message = Dispatcher::new(&Refusing).dispatch(&policy, &sample_result(), &sample_tags());
        assert_eq!(
            message.map(|m| m.subject),
            Some("Job \"Nightly\" finished [ERROR]".to_string())
        );

        let mut smtp = mail();
        smtp.host = "smtp.example.com".to_string();
        let err = StandardSender
            .send(&smtp, &compose(&sample_result(), &sample_tags(), &smtp))
            .expect_err("no transport for real hosts");
        assert!(matches!(err, NotifyError::Unsupported { .. }));
    }

    #[test]
    fn test_config_error_message_is_rendered() {
        let err = ConfigError::missing("source.path");
        let result = JobResult::config_error("job1", Local::now(), &err);
        let text = render(&result, &FileTags::new(), "${status}: ${error} [${file_list}]");
        assert_eq!(
            text,
            "CONFIG_ERROR: \"source.path\" is required [ no data collected]"
        );
    }
}
