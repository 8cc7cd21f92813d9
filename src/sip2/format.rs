//! Outbound SIP2 frame builders.
//!
//! One function per supported command; this is the only place frame
//! layouts are spelled out. Every caller-supplied value passes through
//! the sanitizer before it enters a frame, and every frame leaves with
//! the `AY<seq>AZ<checksum>\r` trailer attached.

use super::checksum;
use super::sanitize::sanitize;
use super::timestamp;
use crate::error::Result;

/// Hold operation mode carried in byte 2 of a Hold (15) request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldMode {
    Add,
    Delete,
    Change,
}

impl HoldMode {
    pub fn as_char(self) -> char {
        match self {
            HoldMode::Add => '+',
            HoldMode::Delete => '-',
            HoldMode::Change => '*',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '+' => Some(HoldMode::Add),
            '-' => Some(HoldMode::Delete),
            '*' => Some(HoldMode::Change),
            _ => None,
        }
    }
}

/// Security marker for an Item Status Update (19) request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityMarker {
    #[default]
    Other,
    None,
    TattleTape,
    WhisperTape,
}

impl SecurityMarker {
    pub fn as_char(self) -> char {
        match self {
            SecurityMarker::Other => '0',
            SecurityMarker::None => '1',
            SecurityMarker::TattleTape => '2',
            SecurityMarker::WhisperTape => '3',
        }
    }
}

/// Which summary lists a Patron Information (63) request asks for.
/// Positions 0-4 of the ten-byte summary field; the rest stay spaces.
#[derive(Debug, Clone, Copy, Default)]
pub struct InfoSummary {
    pub hold_items: bool,
    pub overdue_items: bool,
    pub charged_items: bool,
    pub fine_items: bool,
    pub recall_items: bool,
}

impl InfoSummary {
    fn as_field(self) -> String {
        let mark = |b| if b { 'Y' } else { ' ' };
        format!(
            "{}{}{}{}{}     ",
            mark(self.hold_items),
            mark(self.overdue_items),
            mark(self.charged_items),
            mark(self.fine_items),
            mark(self.recall_items),
        )
    }
}

/// Three-digit language code, defaulting to `001`.
fn lang_code(language: Option<&str>) -> String {
    let lang = sanitize(language.unwrap_or("001"));
    format!("{:0>3.3}", lang)
}

/// Currency padded to exactly three bytes for the fixed field.
fn currency_fixed(currency: &str) -> String {
    format!("{:<3.3}", sanitize(currency))
}

/// Login (93). Both algorithm bytes are `0`: plain-text credentials.
pub fn build_login(user: &str, password: &str, location: &str, seq: u8) -> Result<String> {
    let body = format!(
        "9300CN{}|CO{}|CP{}|",
        sanitize(user),
        sanitize(password),
        sanitize(location)
    );
    checksum::append(&body, seq)
}

/// Patron Status Request (23).
pub fn build_patron_status(
    institution_id: &str,
    patron_barcode: &str,
    language: Option<&str>,
    seq: u8,
) -> Result<String> {
    let body = format!(
        "23{}{}AO{}|AA{}|AC|",
        lang_code(language),
        timestamp::now(),
        sanitize(institution_id),
        sanitize(patron_barcode)
    );
    checksum::append(&body, seq)
}

/// Checkout (11). SC renewal policy `Y`, no-block `N`, blank nb-due-date.
pub fn build_checkout(
    institution_id: &str,
    patron_barcode: &str,
    item_barcode: &str,
    patron_pin: Option<&str>,
    seq: u8,
) -> Result<String> {
    let mut body = format!(
        "11YN{}{:18}AO{}|AA{}|AB{}|AC|",
        timestamp::now(),
        "",
        sanitize(institution_id),
        sanitize(patron_barcode),
        sanitize(item_barcode)
    );
    if let Some(pin) = patron_pin {
        body.push_str(&format!("AD{}|", sanitize(pin)));
    }
    checksum::append(&body, seq)
}

/// Checkin (09). The return date repeats the transaction date.
pub fn build_checkin(institution_id: &str, item_barcode: &str, seq: u8) -> Result<String> {
    let ts = timestamp::now();
    let body = format!(
        "09N{}{}AO{}|AB{}|AC|",
        ts,
        ts,
        sanitize(institution_id),
        sanitize(item_barcode)
    );
    checksum::append(&body, seq)
}

/// Item Information (17).
pub fn build_item_information(institution_id: &str, item_barcode: &str, seq: u8) -> Result<String> {
    let body = format!(
        "17{}AO{}|AB{}|",
        timestamp::now(),
        sanitize(institution_id),
        sanitize(item_barcode)
    );
    checksum::append(&body, seq)
}

/// Renew (29). Same fixed layout as Checkout.
pub fn build_renew(
    institution_id: &str,
    patron_barcode: &str,
    item_barcode: &str,
    patron_pin: Option<&str>,
    seq: u8,
) -> Result<String> {
    let mut body = format!(
        "29YN{}{:18}AO{}|AA{}|AB{}|",
        timestamp::now(),
        "",
        sanitize(institution_id),
        sanitize(patron_barcode),
        sanitize(item_barcode)
    );
    if let Some(pin) = patron_pin {
        body.push_str(&format!("AD{}|", sanitize(pin)));
    }
    checksum::append(&body, seq)
}

/// Fee Paid (37).
#[allow(clippy::too_many_arguments)]
pub fn build_fee_paid(
    institution_id: &str,
    patron_barcode: &str,
    fee_id: &str,
    amount: &str,
    fee_type: Option<&str>,
    payment_type: Option<&str>,
    currency: Option<&str>,
    seq: u8,
) -> Result<String> {
    let currency = currency.unwrap_or("USD");
    let body = format!(
        "37{}{:>2.2}{:>2.2}{}AO{}|AA{}|BK{}|BV{}|BH{}|",
        timestamp::now(),
        sanitize(fee_type.unwrap_or("01")),
        sanitize(payment_type.unwrap_or("00")),
        currency_fixed(currency),
        sanitize(institution_id),
        sanitize(patron_barcode),
        sanitize(fee_id),
        sanitize(amount),
        sanitize(currency).trim()
    );
    checksum::append(&body, seq)
}

/// Patron Information (63).
pub fn build_patron_information(
    institution_id: &str,
    patron_barcode: &str,
    summary: InfoSummary,
    start_item: u16,
    end_item: u16,
    language: Option<&str>,
    seq: u8,
) -> Result<String> {
    let body = format!(
        "63{}{}{}AO{}|AA{}|BP{:04}|BQ{:04}|",
        lang_code(language),
        timestamp::now(),
        summary.as_field(),
        sanitize(institution_id),
        sanitize(patron_barcode),
        start_item.min(9999),
        end_item.min(9999)
    );
    checksum::append(&body, seq)
}

/// Hold (15).
#[allow(clippy::too_many_arguments)]
pub fn build_hold(
    institution_id: &str,
    patron_barcode: &str,
    mode: HoldMode,
    item_barcode: Option<&str>,
    expiry_date: Option<&str>,
    pickup_location: Option<&str>,
    title_id: Option<&str>,
    seq: u8,
) -> Result<String> {
    let mut body = format!("15{}{}", mode.as_char(), timestamp::now());
    if let Some(expiry) = expiry_date {
        body.push_str(&format!("BW{}|", sanitize(expiry)));
    }
    body.push_str(&format!(
        "AO{}|AA{}|",
        sanitize(institution_id),
        sanitize(patron_barcode)
    ));
    if let Some(item) = item_barcode {
        body.push_str(&format!("AB{}|", sanitize(item)));
    }
    if let Some(title) = title_id {
        body.push_str(&format!("BT{}|", sanitize(title)));
    }
    if let Some(pickup) = pickup_location {
        body.push_str(&format!("BS{}|", sanitize(pickup)));
    }
    body.push_str("AC|");
    checksum::append(&body, seq)
}

/// Renew All (65). The nb-due-date repeats the transaction date.
pub fn build_renew_all(institution_id: &str, patron_barcode: &str, seq: u8) -> Result<String> {
    let ts = timestamp::now();
    let body = format!(
        "65{}{}AO{}|AA{}|AC|",
        ts,
        ts,
        sanitize(institution_id),
        sanitize(patron_barcode)
    );
    checksum::append(&body, seq)
}

/// End Patron Session (35).
pub fn build_end_session(institution_id: &str, patron_barcode: &str, seq: u8) -> Result<String> {
    let body = format!(
        "35{}AO{}|AA{}|AC|",
        timestamp::now(),
        sanitize(institution_id),
        sanitize(patron_barcode)
    );
    checksum::append(&body, seq)
}

/// SC Status (99). Status code `0` (SC ok), 80-column print width,
/// protocol version 2.00.
pub fn build_sc_status(seq: u8) -> Result<String> {
    checksum::append("9900802.00", seq)
}

/// Block Patron (01). Fire-and-forget: SIP2 defines no response.
pub fn build_block_patron(
    institution_id: &str,
    patron_barcode: &str,
    card_retained: bool,
    message: &str,
    seq: u8,
) -> Result<String> {
    let body = format!(
        "01{}{}AO{}|AA{}|AC|AL{}|",
        if card_retained { 'Y' } else { 'N' },
        timestamp::now(),
        sanitize(institution_id),
        sanitize(patron_barcode),
        sanitize(message)
    );
    checksum::append(&body, seq)
}

/// Item Status Update (19).
pub fn build_item_status_update(
    institution_id: &str,
    item_barcode: &str,
    marker: SecurityMarker,
    seq: u8,
) -> Result<String> {
    let body = format!(
        "19{}{}AO{}|AB{}|",
        marker.as_char(),
        timestamp::now(),
        sanitize(institution_id),
        sanitize(item_barcode)
    );
    checksum::append(&body, seq)
}

/// Patron Enable (25).
pub fn build_patron_enable(
    institution_id: &str,
    patron_barcode: &str,
    patron_pin: Option<&str>,
    seq: u8,
) -> Result<String> {
    let mut body = format!(
        "25{}AO{}|AA{}|AC|",
        timestamp::now(),
        sanitize(institution_id),
        sanitize(patron_barcode)
    );
    if let Some(pin) = patron_pin {
        body.push_str(&format!("AD{}|", sanitize(pin)));
    }
    checksum::append(&body, seq)
}
