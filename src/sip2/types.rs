//! Typed SIP2 response records.
//!
//! Field names serialize in camelCase: the transaction payloads the
//! connection manager emits use these names, and the masking service's
//! key rules are written against them. Missing wire fields fall back to
//! empty strings, zero counts, or `false` flags; unknown vendor tags
//! land in `extensions`, which is omitted entirely when empty.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Vendor extension tags: everything outside a variant's known set.
pub type Extensions = BTreeMap<String, String>;

/// The fourteen fixed-position patron status flags of a 24/26/64 response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatronStatusFlags {
    pub charge_privileges_denied: bool,
    pub renewal_privileges_denied: bool,
    pub recall_privileges_denied: bool,
    pub hold_privileges_denied: bool,
    pub card_reported_lost: bool,
    pub too_many_items_charged: bool,
    pub too_many_items_overdue: bool,
    pub too_many_renewals: bool,
    pub too_many_claims_of_items_returned: bool,
    pub too_many_items_lost: bool,
    pub excessive_outstanding_fines: bool,
    pub excessive_outstanding_fees: bool,
    pub recall_overdue: bool,
    pub too_many_items_billed: bool,
}

/// Patron Status Response (24) and Patron Enable Response (26).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatronStatusResponse {
    pub flags: PatronStatusFlags,
    pub language: String,
    pub transaction_date: String,
    pub institution_id: String,
    pub patron_barcode: String,
    pub patron_name: String,
    pub valid_patron: bool,
    pub hold_items_count: u32,
    pub overdue_items_count: u32,
    pub charged_items_count: u32,
    pub charged_items: Vec<String>,
    pub unavailable_holds: String,
    pub hold_items: String,
    pub print_line: String,
    pub screen_messages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Extensions>,
}

/// Checkout Response (12); Renew (30) shares the layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub ok: bool,
    pub renewal_ok: bool,
    pub magnetic_media: bool,
    pub desensitize: bool,
    pub transaction_date: String,
    pub institution_id: String,
    pub patron_barcode: String,
    pub item_barcode: String,
    pub title_identifier: String,
    pub due_date: String,
    pub fee_amount: String,
    pub print_line: String,
    pub screen_messages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Extensions>,
}

/// Checkin Response (10).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckinResponse {
    pub ok: bool,
    pub resensitize: bool,
    pub magnetic_media: bool,
    pub alert: bool,
    pub transaction_date: String,
    pub institution_id: String,
    pub item_barcode: String,
    pub title_identifier: String,
    pub permanent_location: String,
    pub print_line: String,
    pub screen_messages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Extensions>,
}

/// Item Information Response (18).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemInformationResponse {
    pub circulation_status: u32,
    pub security_marker: u32,
    pub fee_type: u32,
    pub transaction_date: String,
    pub institution_id: String,
    pub item_barcode: String,
    pub title_identifier: String,
    pub owner: String,
    pub currency: String,
    pub media_type: String,
    pub screen_messages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Extensions>,
}

/// Fee Paid Response (38).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeePaidResponse {
    pub payment_accepted: bool,
    pub transaction_date: String,
    pub institution_id: String,
    pub patron_barcode: String,
    pub transaction_id: String,
    pub currency: String,
    pub screen_messages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Extensions>,
}

/// Patron Information Response (64).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatronInformationResponse {
    pub flags: PatronStatusFlags,
    pub language: String,
    pub transaction_date: String,
    pub hold_items_count: u32,
    pub overdue_items_count: u32,
    pub charged_items_count: u32,
    pub fine_items_count: u32,
    pub recall_items_count: u32,
    pub unavailable_holds_count: u32,
    pub institution_id: String,
    pub patron_barcode: String,
    pub patron_name: String,
    pub valid_patron: bool,
    pub email_address: String,
    pub phone_number: String,
    pub home_address: String,
    pub start_item: String,
    pub end_item: String,
    pub overdue_items: Vec<String>,
    pub charged_items: Vec<String>,
    pub fine_items: Vec<String>,
    pub recall_items: Vec<String>,
    pub unavailable_hold_items: Vec<String>,
    pub screen_messages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Extensions>,
}

/// Hold Response (16).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldResponse {
    pub ok: bool,
    pub available: bool,
    pub transaction_date: String,
    pub institution_id: String,
    pub patron_barcode: String,
    pub item_barcode: String,
    pub title_identifier: String,
    pub expiration_date: String,
    pub pickup_location: String,
    pub queue_position: String,
    pub print_line: String,
    pub screen_messages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Extensions>,
}

/// Renew All Response (66).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewAllResponse {
    pub ok: bool,
    pub renewed_count: u32,
    pub unrenewed_count: u32,
    pub transaction_date: String,
    pub institution_id: String,
    pub patron_barcode: String,
    pub renewed_items: Vec<String>,
    pub unrenewed_items: Vec<String>,
    pub screen_messages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Extensions>,
}

/// End Session Response (36).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndSessionResponse {
    pub end_session: bool,
    pub transaction_date: String,
    pub institution_id: String,
    pub patron_barcode: String,
    pub print_line: String,
    pub screen_messages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Extensions>,
}

/// ACS Status Response (98).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcsStatusResponse {
    pub on_line: bool,
    pub checkin_ok: bool,
    pub checkout_ok: bool,
    pub acs_renewal_policy: bool,
    pub status_update_ok: bool,
    pub offline_ok: bool,
    pub timeout_period: u32,
    pub retries_allowed: u32,
    pub date_time_sync: String,
    pub protocol_version: String,
    pub institution_id: String,
    pub library_name: String,
    pub supported_messages: String,
    pub terminal_location: String,
    pub screen_messages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Extensions>,
}

/// Item Status Update Response (20).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemStatusUpdateResponse {
    pub item_properties_ok: bool,
    pub transaction_date: String,
    pub institution_id: String,
    pub item_barcode: String,
    pub title_identifier: String,
    pub print_line: String,
    pub screen_messages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Extensions>,
}

/// Any parsed response, tagged by its wire command code.
#[derive(Debug, Clone)]
pub enum Response {
    PatronStatus(PatronStatusResponse),
    Checkout(CheckoutResponse),
    Checkin(CheckinResponse),
    ItemInformation(ItemInformationResponse),
    FeePaid(FeePaidResponse),
    PatronInformation(PatronInformationResponse),
    Hold(HoldResponse),
    RenewAll(RenewAllResponse),
    EndSession(EndSessionResponse),
    AcsStatus(AcsStatusResponse),
    ItemStatusUpdate(ItemStatusUpdateResponse),
}
