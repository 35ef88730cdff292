//! Display and input helpers for the store's local formats.
//!
//! Dates are stored as ISO `YYYY-MM-DD` but shown as `dd/mm/YYYY`; CPF and
//! phone numbers are masked as the operator types them.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::error::{PosError, PosResult};

const BR_DATE: &str = "%d/%m/%Y";
const TIME: &str = "%H:%M:%S";

/// `2024-05-10` -> `10/05/2024`.
pub fn br_date(date: NaiveDate) -> String {
    date.format(BR_DATE).to_string()
}

/// `10/05/2024` -> `2024-05-10`.
pub fn parse_br_date(input: &str) -> PosResult<NaiveDate> {
    NaiveDate::parse_from_str(input.trim(), BR_DATE)
        .map_err(|_| PosError::validation(format!("invalid date (expected dd/mm/yyyy): {input}")))
}

/// Time of day as stored in the database (`HH:MM:SS`, no fraction).
pub fn time_str(time: NaiveTime) -> String {
    time.format(TIME).to_string()
}

pub fn parse_time(input: &str) -> PosResult<NaiveTime> {
    NaiveTime::parse_from_str(input.trim(), TIME)
        .map_err(|_| PosError::validation(format!("invalid time: {input}")))
}

/// Timestamp used in generated file names (`20240510_143000`).
pub fn file_stamp(at: NaiveDateTime) -> String {
    at.format("%Y%m%d_%H%M%S").to_string()
}

/// Safe file-name form of a store date (`10-05-2024`).
pub fn file_date(date: NaiveDate) -> String {
    date.format("%d-%m-%Y").to_string()
}

fn digits(input: &str, max: usize) -> String {
    input.chars().filter(char::is_ascii_digit).take(max).collect()
}

/// Mask a CPF as `000.000.000-00`, tolerating partial input.
pub fn format_cpf(input: &str) -> String {
    let mut out = String::with_capacity(14);
    for (i, c) in digits(input, 11).chars().enumerate() {
        match i {
            3 | 6 => out.push('.'),
            9 => out.push('-'),
            _ => {}
        }
        out.push(c);
    }
    out
}

/// Mask a phone number as `(00) 00000-0000`, tolerating partial input.
pub fn format_phone(input: &str) -> String {
    let mut out = String::with_capacity(15);
    for (i, c) in digits(input, 11).chars().enumerate() {
        match i {
            0 => out.push('('),
            2 => out.push_str(") "),
            7 => out.push('-'),
            _ => {}
        }
        out.push(c);
    }
    out
}
