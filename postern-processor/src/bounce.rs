//! Non-delivery notifications.

use postern_common::{
    address::MailAddress,
    mail::Mail,
    message::{Header, MessageSource},
};

/// Build a bounce for `original`, addressed to its sender.
///
/// The bounce has a null sender so it can never bounce itself. The body
/// names the failed recipients and the reason, followed by the original
/// headers. `None` if `original` has a null sender.
pub fn build(
    original: &Mail,
    recipients: &[MailAddress],
    reason: &str,
    hostname: &str,
    postmaster: &MailAddress,
) -> Option<Mail> {
    let sender = original.sender.clone()?;

    let subject = original.message.header("Subject").unwrap_or_default();
    let headers = vec![
        Header::new("From", format!("MAILER-DAEMON@{hostname}")),
        Header::new("Reply-To", postmaster.to_string()),
        Header::new("To", sender.to_string()),
        Header::new("Subject", format!("Undeliverable mail: {subject}")),
        Header::new("Date", chrono::Utc::now().to_rfc2822()),
        Header::new("Auto-Submitted", "auto-replied"),
    ];

    let listed = recipients
        .iter()
        .map(|recipient| format!("  <{recipient}>\r\n"))
        .collect::<String>();
    let original_headers = original
        .message
        .headers()
        .iter()
        .map(|header| format!("{}: {}\r\n", header.name, header.value))
        .collect::<String>();

    let body = format!(
        "This is the mail system at {hostname}.\r\n\r\n\
         Your message could not be delivered to the following recipients:\r\n\r\n\
         {listed}\r\n\
         Reason: {reason}\r\n\r\n\
         --- Original message headers ---\r\n\r\n\
         {original_headers}"
    );

    let mut bounce = Mail::new(
        None,
        vec![sender],
        MessageSource::new(headers, body.into_bytes()),
    );
    bounce.remote_host = hostname.to_string();
    bounce.set_error(reason);

    Some(bounce)
}
