use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::*;
use crate::model::Contact;

use super::conflict::{
    check_horizon, check_not_past, check_time_grid, comments_error, email_error, name_error, now,
    phone_error, validate_customer,
};
use super::mutations::ReservationRequest;
use super::planner::tables_needed;
use super::{Engine, EngineError};

/// Raw booking form as submitted. Every field is optional text so that each problem can
/// be reported against its own field.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReservationForm {
    pub date: Option<String>,
    pub time: Option<String>,
    pub guests: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub comments: Option<String>,
    /// Comma-separated table numbers.
    pub tables: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationErrors {
    pub field_errors: BTreeMap<&'static str, Vec<String>>,
    pub non_field_errors: Vec<String>,
}

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.field_errors.is_empty() && self.non_field_errors.is_empty()
    }

    pub fn add_field(&mut self, field: &'static str, message: impl Into<String>) {
        self.field_errors.entry(field).or_default().push(message.into());
    }

    pub fn add_non_field(&mut self, message: impl Into<String>) {
        self.non_field_errors.push(message.into());
    }

    /// File an engine error under its field, or as a form-level error.
    pub fn add(&mut self, err: &EngineError) {
        match err.field() {
            Some(field) => self.add_field(field, err.to_string()),
            None => self.add_non_field(err.to_string()),
        }
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.field_errors.contains_key(field)
    }
}

impl From<&EngineError> for ValidationErrors {
    fn from(err: &EngineError) -> Self {
        let mut errors = Self::default();
        errors.add(err);
        errors
    }
}

const REQUIRED: &str = "This field is required.";

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

pub(crate) fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

/// `HH:MM`, or `HH:MM:SS` as browsers sometimes send it.
pub(crate) fn parse_time(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .ok()
}

pub(crate) fn parse_table_numbers(raw: &str) -> Option<Vec<u32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u32>().ok())
        .collect()
}

impl Engine {
    /// Conflict Validator: field checks, then a fresh availability check against live state.
    ///
    /// Runs independently of [`Engine::allocate`], which repeats the availability check
    /// under its own lock; this one only reports.
    pub async fn validate_reservation(
        &self,
        form: &ReservationForm,
        customer_user: Option<String>,
        editing: Option<Ulid>,
    ) -> Result<ReservationRequest, ValidationErrors> {
        let mut errors = ValidationErrors::default();
        let now = now();

        let date = match present(&form.date) {
            None => {
                errors.add_field("date", REQUIRED);
                None
            }
            Some(raw) => match parse_date(raw) {
                None => {
                    errors.add_field("date", "Enter a valid date.");
                    None
                }
                Some(d) if d < now.date_naive() => {
                    errors.add_field("date", "Date cannot be in the past.");
                    None
                }
                Some(d) => match check_horizon(d, now) {
                    Ok(()) => Some(d),
                    Err(e) => {
                        errors.add(&e);
                        None
                    }
                },
            },
        };

        let time = match present(&form.time) {
            None => {
                errors.add_field("time", REQUIRED);
                None
            }
            Some(raw) => match parse_time(raw).map(|t| (t, check_time_grid(t))) {
                Some((t, Ok(()))) => Some(t),
                _ => {
                    errors.add_field("time", "Select a valid time.");
                    None
                }
            },
        };

        let guests = match present(&form.guests) {
            None => {
                errors.add_field("guests", REQUIRED);
                None
            }
            Some(raw) => match raw.parse::<u32>() {
                Err(_) => {
                    errors.add_field("guests", "Enter a whole number.");
                    None
                }
                Ok(g) if tables_needed(g).is_err() => {
                    errors.add_field(
                        "guests",
                        format!("Ensure this value is between {MIN_GUESTS} and {MAX_GUESTS}."),
                    );
                    None
                }
                Ok(g) => Some(g),
            },
        };

        let contact = Contact {
            name: present(&form.name).unwrap_or_default().to_string(),
            email: present(&form.email).unwrap_or_default().to_string(),
            phone_number: present(&form.phone_number).unwrap_or_default().to_string(),
            comments: present(&form.comments).map(str::to_string),
        };
        for err in [
            name_error(&contact.name),
            email_error(&contact.email),
            phone_error(&contact.phone_number),
            comments_error(contact.comments.as_deref()),
        ]
        .iter()
        .flatten()
        {
            errors.add(err);
        }
        if let Err(e) = validate_customer(customer_user.as_deref()) {
            errors.add(&e);
        }

        let table_numbers = match present(&form.tables) {
            None => Vec::new(),
            Some(raw) => parse_table_numbers(raw).unwrap_or_else(|| {
                errors.add_field("tables", "Enter table numbers separated by commas.");
                Vec::new()
            }),
        };

        if let (Some(date), Some(time)) = (date, time) {
            if let Err(e) = check_not_past(date, time, now) {
                errors.add(&e);
            }
            let free = self.free_tables_at(date, time, editing).await;
            if table_numbers.is_empty() {
                if let Some(needed) = guests.and_then(|g| tables_needed(g).ok())
                    && free.len() < needed
                {
                    errors.add_non_field("Not enough free tables for the selected time.");
                }
            } else {
                let all = self.list_tables().await;
                for n in &table_numbers {
                    if !all.iter().any(|t| t.number == *n) {
                        errors.add_field("tables", format!("Table {n} does not exist."));
                    }
                }
                let all_free = table_numbers
                    .iter()
                    .filter(|n| all.iter().any(|t| t.number == **n))
                    .all(|n| free.iter().any(|t| t.number == *n));
                if !all_free {
                    errors.add_field(
                        "tables",
                        "All selected tables must be free at the selected time.",
                    );
                }
            }
        }

        let (Some(date), Some(time), Some(guests)) = (date, time, guests) else {
            return Err(errors);
        };
        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(ReservationRequest {
            date,
            time,
            guests,
            contact,
            customer_user,
            tables: table_numbers,
        })
    }
}

/// Raw contact-page form.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactMessageForm {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactMessage {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub message: String,
}

impl ContactMessageForm {
    pub fn validate(&self) -> Result<ContactMessage, ValidationErrors> {
        let mut errors = ValidationErrors::default();

        let name = present(&self.name).unwrap_or_default();
        if name.is_empty() {
            errors.add_field("name", REQUIRED);
        } else if name.chars().count() > MAX_CONTACT_NAME_LEN {
            errors.add_field(
                "name",
                format!("Name must be at most {MAX_CONTACT_NAME_LEN} characters."),
            );
        }

        let email = present(&self.email).unwrap_or_default();
        if let Some(e) = email_error(email) {
            errors.add(&e);
        }

        let phone = present(&self.phone).unwrap_or_default();
        if phone.is_empty() {
            errors.add_field("phone", REQUIRED);
        } else if phone.chars().count() > MAX_PHONE_LEN {
            errors.add_field(
                "phone",
                format!("Phone must be at most {MAX_PHONE_LEN} characters."),
            );
        }

        let message = present(&self.message).unwrap_or_default();
        if message.is_empty() {
            errors.add_field("message", REQUIRED);
        } else if message.chars().count() > MAX_MESSAGE_LEN {
            errors.add_field(
                "message",
                format!("Message must be at most {MAX_MESSAGE_LEN} characters."),
            );
        }

        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(ContactMessage {
            name: name.to_string(),
            email: email.to_string(),
            phone: phone.to_string(),
            message: message.to_string(),
        })
    }
}
