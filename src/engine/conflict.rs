use chrono::{DateTime, Duration, Local, NaiveDate, NaiveTime, TimeZone, Timelike};

use crate::limits::*;
use crate::model::Contact;

use super::EngineError;

pub(crate) fn now() -> DateTime<Local> {
    Local::now()
}

/// Rejects a date before today, then a start instant already behind `now`.
/// The naive wall-clock start is resolved in the local zone first.
pub(crate) fn check_not_past(
    date: NaiveDate,
    time: NaiveTime,
    now: DateTime<Local>,
) -> Result<(), EngineError> {
    if date < now.date_naive() {
        return Err(EngineError::PastDateTime);
    }
    let start = Local
        .from_local_datetime(&date.and_time(time))
        .earliest()
        .ok_or_else(|| EngineError::invalid("time", "This time does not exist in the local time zone."))?;
    if start < now {
        return Err(EngineError::PastDateTime);
    }
    Ok(())
}

pub(crate) fn check_horizon(date: NaiveDate, now: DateTime<Local>) -> Result<(), EngineError> {
    if date > now.date_naive() + Duration::days(MAX_DAYS_AHEAD) {
        return Err(EngineError::invalid("date", "Bookings open at most a year ahead."));
    }
    Ok(())
}

/// Start times sit on the half-hour grid.
pub(crate) fn check_time_grid(time: NaiveTime) -> Result<(), EngineError> {
    if time.second() != 0 || time.nanosecond() != 0 || time.minute() % SLOT_STEP_MINUTES != 0 {
        return Err(EngineError::invalid("time", "Select a valid time."));
    }
    Ok(())
}

pub(crate) fn name_error(name: &str) -> Option<EngineError> {
    if name.trim().is_empty() {
        return Some(EngineError::invalid("name", "This field is required."));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Some(EngineError::invalid("name", format!("Name must be at most {MAX_NAME_LEN} characters.")));
    }
    if name.chars().any(|c| c.is_ascii_digit()) {
        return Some(EngineError::invalid("name", "Name cannot contain digits."));
    }
    None
}

pub(crate) fn email_error(email: &str) -> Option<EngineError> {
    if email.trim().is_empty() {
        return Some(EngineError::invalid("email", "This field is required."));
    }
    if email.len() > MAX_EMAIL_LEN || !looks_like_email(email) {
        return Some(EngineError::invalid("email", "Enter a valid email address."));
    }
    None
}

fn looks_like_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

pub(crate) fn phone_error(phone: &str) -> Option<EngineError> {
    if phone.is_empty() {
        return Some(EngineError::invalid("phone_number", "This field is required."));
    }
    if phone.len() > MAX_PHONE_LEN {
        return Some(EngineError::invalid(
            "phone_number",
            format!("Phone number must be at most {MAX_PHONE_LEN} characters."),
        ));
    }
    if !phone.chars().all(|c| c.is_ascii_digit() || c == '+') {
        return Some(EngineError::invalid(
            "phone_number",
            "Phone number may only contain digits and '+'.",
        ));
    }
    None
}

pub(crate) fn comments_error(comments: Option<&str>) -> Option<EngineError> {
    match comments {
        Some(c) if c.chars().count() > MAX_COMMENTS_LEN => Some(EngineError::invalid(
            "comments",
            format!("Comments must be at most {MAX_COMMENTS_LEN} characters."),
        )),
        _ => None,
    }
}

/// Every contact problem, in form field order.
pub(crate) fn contact_errors(contact: &Contact) -> Vec<EngineError> {
    [
        name_error(&contact.name),
        email_error(&contact.email),
        phone_error(&contact.phone_number),
        comments_error(contact.comments.as_deref()),
    ]
    .into_iter()
    .flatten()
    .collect()
}

pub(crate) fn validate_contact(contact: &Contact) -> Result<(), EngineError> {
    match contact_errors(contact).into_iter().next() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

pub(crate) fn validate_customer(customer_user: Option<&str>) -> Result<(), EngineError> {
    match customer_user {
        Some(c) if c.is_empty() || c.len() > MAX_CUSTOMER_ID_LEN => {
            Err(EngineError::LimitExceeded("customer id length"))
        }
        _ => Ok(()),
    }
}
