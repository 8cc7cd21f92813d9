//! Inbound SIP2 frame parsing.
//!
//! The two-byte command code selects the variant; fixed-position header
//! bytes are extracted positionally, then the remainder is split on `|`.
//! The first segment may carry one variable field directly behind the
//! fixed header (standard SIP2 omits the delimiter there), discovered by
//! scanning for a two-uppercase-letter tag at or after the variant's
//! threshold. Tags outside the variant's known set pass through into
//! `extensions` untouched, which is how vendor dialects stay usable
//! without per-vendor types.
//!
//! Parsing is total over truncated and malformed input: absent fields
//! become empty strings, zero, or `false`. Only a command-code mismatch
//! is an error.

use std::collections::HashMap;

use tracing::{debug, trace};

use super::types::*;
use crate::error::{Result, Sip2Error};

/// Tags that may repeat and are exposed as ordered lists.
const REPEATABLE: &[&str] = &["AF", "AT", "AU", "AV", "BU", "BJ", "BM", "BN"];

/// Split a frame into positional header chars and tagged fields.
struct Dissected {
    /// Every char of the first `|`-segment; fixed fields index into this.
    header: Vec<char>,
    values: HashMap<String, String>,
    lists: HashMap<String, Vec<String>>,
}

impl Dissected {
    fn take(&mut self, tag: &str) -> String {
        self.values.remove(tag).unwrap_or_default()
    }

    fn take_list(&mut self, tag: &str) -> Vec<String> {
        self.lists.remove(tag).unwrap_or_default()
    }

    fn take_flag(&mut self, tag: &str) -> bool {
        self.take(tag) == "Y"
    }

    /// Whatever is left over, minus the trailer pair, becomes `extensions`.
    fn into_extensions(mut self) -> Option<Extensions> {
        self.values.remove("AY");
        self.values.remove("AZ");
        for (tag, mut occurrences) in self.lists.drain() {
            if let Some(first) = occurrences.drain(..).next() {
                self.values.entry(tag).or_insert(first);
            }
        }
        if self.values.is_empty() {
            None
        } else {
            Some(self.values.into_iter().collect())
        }
    }
}

/// Strip a trailing `AY<d>AZ<hex4>` pair (and optional `\r`), returning
/// the prefix and the sequence digit for diagnostics.
fn strip_trailer(frame: &str) -> (&str, Option<char>) {
    let frame = frame.trim_end_matches(['\r', '\n']);
    let b = frame.as_bytes();
    let n = b.len();
    if n >= 9
        && &b[n - 9..n - 7] == b"AY"
        && b[n - 7].is_ascii_digit()
        && &b[n - 6..n - 4] == b"AZ"
        && b[n - 4..].iter().all(|c| c.is_ascii_hexdigit())
    {
        (&frame[..n - 9], Some(b[n - 7] as char))
    } else {
        (frame, None)
    }
}

/// The sequence digit of a frame's `AY<d>AZ<hex4>` trailer, if present.
/// The client uses this to route responses back to pending requests.
pub(crate) fn sequence_digit(frame: &str) -> Option<u8> {
    let (_, seq) = strip_trailer(frame);
    seq.and_then(|c| c.to_digit(10)).map(|d| d as u8)
}

fn dissect(frame: &str, threshold: usize) -> Dissected {
    let (body, sequence) = strip_trailer(frame);
    if let Some(seq) = sequence {
        trace!(sequence = %seq, "frame trailer");
    }

    let mut segments = body.split('|');
    let header: Vec<char> = segments.next().unwrap_or("").chars().collect();

    let mut out = Dissected { header, values: HashMap::new(), lists: HashMap::new() };

    // The first segment can carry one variable field straight after the
    // fixed header. The value runs to the end of the segment: identifiers
    // like barcodes legitimately contain uppercase pairs of their own.
    let mut idx = threshold;
    while idx + 1 < out.header.len() {
        if out.header[idx].is_ascii_uppercase() && out.header[idx + 1].is_ascii_uppercase() {
            if idx > threshold {
                debug!(idx, threshold, "inline tag found past threshold");
            }
            let tag: String = out.header[idx..idx + 2].iter().collect();
            let value: String = out.header[idx + 2..].iter().collect();
            add_field(&mut out, &tag, value);
            break;
        }
        idx += 1;
    }

    for segment in segments {
        let mut chars = segment.chars();
        match (chars.next(), chars.next()) {
            (Some(a), Some(b)) if a.is_ascii_uppercase() && b.is_ascii_uppercase() => {
                let tag: String = [a, b].iter().collect();
                add_field(&mut out, &tag, chars.collect());
            }
            (None, _) => {}
            _ => trace!(segment, "skipping segment without a tag"),
        }
    }

    out
}

fn add_field(out: &mut Dissected, tag: &str, value: String) {
    if REPEATABLE.contains(&tag) {
        out.lists.entry(tag.to_string()).or_default().push(value);
    } else {
        out.values.entry(tag.to_string()).or_insert(value);
    }
}

/// Fixed-position `Y` flag, `false` when absent.
fn flag(header: &[char], pos: usize) -> bool {
    matches!(header.get(pos), Some('Y'))
}

/// Fixed-position ok digit: `1` means ok.
fn ok_digit(header: &[char], pos: usize) -> bool {
    matches!(header.get(pos), Some('1'))
}

/// Fixed-position text run, clamped to what the frame actually carries.
fn text(header: &[char], pos: usize, len: usize) -> String {
    header.iter().skip(pos).take(len).collect()
}

/// Fixed-position decimal count: leading spaces trimmed, default 0.
fn count(header: &[char], pos: usize, len: usize) -> u32 {
    text(header, pos, len).trim().parse().unwrap_or(0)
}

fn expect_code(frame: &str, expected: &'static str) -> Result<()> {
    let code: String = frame.chars().take(2).collect();
    if code == expected {
        Ok(())
    } else {
        Err(Sip2Error::UnexpectedResponseCode { expected, got: code })
    }
}

fn patron_status_flags(header: &[char], pos: usize) -> PatronStatusFlags {
    PatronStatusFlags {
        charge_privileges_denied: flag(header, pos),
        renewal_privileges_denied: flag(header, pos + 1),
        recall_privileges_denied: flag(header, pos + 2),
        hold_privileges_denied: flag(header, pos + 3),
        card_reported_lost: flag(header, pos + 4),
        too_many_items_charged: flag(header, pos + 5),
        too_many_items_overdue: flag(header, pos + 6),
        too_many_renewals: flag(header, pos + 7),
        too_many_claims_of_items_returned: flag(header, pos + 8),
        too_many_items_lost: flag(header, pos + 9),
        excessive_outstanding_fines: flag(header, pos + 10),
        excessive_outstanding_fees: flag(header, pos + 11),
        recall_overdue: flag(header, pos + 12),
        too_many_items_billed: flag(header, pos + 13),
    }
}

fn parse_patron_status_like(frame: &str, expected: &'static str) -> Result<PatronStatusResponse> {
    expect_code(frame, expected)?;
    let mut d = dissect(frame, 37);
    let header = d.header.clone();
    Ok(PatronStatusResponse {
        flags: patron_status_flags(&header, 2),
        language: text(&header, 16, 3),
        transaction_date: text(&header, 19, 18),
        institution_id: d.take("AO"),
        patron_barcode: d.take("AA"),
        patron_name: d.take("AE"),
        valid_patron: d.take_flag("BL"),
        hold_items_count: d.take("BZ").trim().parse().unwrap_or(0),
        overdue_items_count: d.take("CA").trim().parse().unwrap_or(0),
        charged_items_count: d.take("CB").trim().parse().unwrap_or(0),
        charged_items: d.take_list("AU"),
        unavailable_holds: d.take("CD"),
        hold_items: d.take("AS"),
        print_line: d.take("AG"),
        screen_messages: d.take_list("AF"),
        extensions: d.into_extensions(),
    })
}

/// Patron Status Response (24).
pub fn parse_patron_status(frame: &str) -> Result<PatronStatusResponse> {
    parse_patron_status_like(frame, "24")
}

/// Patron Enable Response (26); same layout as 24.
pub fn parse_patron_enable(frame: &str) -> Result<PatronStatusResponse> {
    parse_patron_status_like(frame, "26")
}

fn parse_checkout_like(frame: &str, expected: &'static str) -> Result<CheckoutResponse> {
    expect_code(frame, expected)?;
    let mut d = dissect(frame, 24);
    let header = d.header.clone();
    Ok(CheckoutResponse {
        ok: ok_digit(&header, 2),
        renewal_ok: flag(&header, 3),
        magnetic_media: flag(&header, 4),
        desensitize: flag(&header, 5),
        transaction_date: text(&header, 6, 18),
        institution_id: d.take("AO"),
        patron_barcode: d.take("AA"),
        item_barcode: d.take("AB"),
        title_identifier: d.take("AJ"),
        due_date: d.take("AH"),
        fee_amount: d.take("BV"),
        print_line: d.take("AG"),
        screen_messages: d.take_list("AF"),
        extensions: d.into_extensions(),
    })
}

/// Checkout Response (12).
pub fn parse_checkout(frame: &str) -> Result<CheckoutResponse> {
    parse_checkout_like(frame, "12")
}

/// Renew Response (30); decodes with the Checkout layout.
pub fn parse_renew(frame: &str) -> Result<CheckoutResponse> {
    parse_checkout_like(frame, "30")
}

/// Checkin Response (10).
pub fn parse_checkin(frame: &str) -> Result<CheckinResponse> {
    expect_code(frame, "10")?;
    let mut d = dissect(frame, 24);
    let header = d.header.clone();
    Ok(CheckinResponse {
        ok: ok_digit(&header, 2),
        resensitize: flag(&header, 3),
        magnetic_media: flag(&header, 4),
        alert: flag(&header, 5),
        transaction_date: text(&header, 6, 18),
        institution_id: d.take("AO"),
        item_barcode: d.take("AB"),
        title_identifier: d.take("AJ"),
        permanent_location: d.take("AQ"),
        print_line: d.take("AG"),
        screen_messages: d.take_list("AF"),
        extensions: d.into_extensions(),
    })
}

/// Item Information Response (18).
pub fn parse_item_information(frame: &str) -> Result<ItemInformationResponse> {
    expect_code(frame, "18")?;
    let mut d = dissect(frame, 26);
    let header = d.header.clone();
    Ok(ItemInformationResponse {
        circulation_status: count(&header, 2, 2),
        security_marker: count(&header, 4, 2),
        fee_type: count(&header, 6, 2),
        transaction_date: text(&header, 8, 18),
        institution_id: d.take("AO"),
        item_barcode: d.take("AB"),
        title_identifier: d.take("AJ"),
        owner: d.take("BG"),
        currency: d.take("BH"),
        media_type: d.take("CK"),
        screen_messages: d.take_list("AF"),
        extensions: d.into_extensions(),
    })
}

/// Fee Paid Response (38).
pub fn parse_fee_paid(frame: &str) -> Result<FeePaidResponse> {
    expect_code(frame, "38")?;
    let mut d = dissect(frame, 21);
    let header = d.header.clone();
    Ok(FeePaidResponse {
        payment_accepted: flag(&header, 2),
        transaction_date: text(&header, 3, 18),
        institution_id: d.take("AO"),
        patron_barcode: d.take("AA"),
        transaction_id: d.take("BK"),
        currency: d.take("BH"),
        screen_messages: d.take_list("AF"),
        extensions: d.into_extensions(),
    })
}

/// Patron Information Response (64).
pub fn parse_patron_information(frame: &str) -> Result<PatronInformationResponse> {
    expect_code(frame, "64")?;
    let mut d = dissect(frame, 61);
    let header = d.header.clone();
    Ok(PatronInformationResponse {
        flags: patron_status_flags(&header, 2),
        language: text(&header, 16, 3),
        transaction_date: text(&header, 19, 18),
        hold_items_count: count(&header, 37, 4),
        overdue_items_count: count(&header, 41, 4),
        charged_items_count: count(&header, 45, 4),
        fine_items_count: count(&header, 49, 4),
        recall_items_count: count(&header, 53, 4),
        unavailable_holds_count: count(&header, 57, 4),
        institution_id: d.take("AO"),
        patron_barcode: d.take("AA"),
        patron_name: d.take("AE"),
        valid_patron: d.take_flag("BL"),
        email_address: d.take("BE"),
        phone_number: d.take("BF"),
        home_address: d.take("BD"),
        start_item: d.take("BP"),
        end_item: d.take("BQ"),
        overdue_items: d.take_list("AT"),
        charged_items: d.take_list("AU"),
        fine_items: d.take_list("AV"),
        recall_items: d.take_list("BU"),
        unavailable_hold_items: d.take_list("BJ"),
        screen_messages: d.take_list("AF"),
        extensions: d.into_extensions(),
    })
}

/// Hold Response (16).
pub fn parse_hold(frame: &str) -> Result<HoldResponse> {
    expect_code(frame, "16")?;
    let mut d = dissect(frame, 22);
    let header = d.header.clone();
    Ok(HoldResponse {
        ok: ok_digit(&header, 2),
        available: flag(&header, 3),
        transaction_date: text(&header, 4, 18),
        institution_id: d.take("AO"),
        patron_barcode: d.take("AA"),
        item_barcode: d.take("AB"),
        title_identifier: d.take("AJ"),
        expiration_date: d.take("BW"),
        pickup_location: d.take("BS"),
        queue_position: d.take("MN"),
        print_line: d.take("AG"),
        screen_messages: d.take_list("AF"),
        extensions: d.into_extensions(),
    })
}

/// Renew All Response (66).
pub fn parse_renew_all(frame: &str) -> Result<RenewAllResponse> {
    expect_code(frame, "66")?;
    let mut d = dissect(frame, 29);
    let header = d.header.clone();
    Ok(RenewAllResponse {
        ok: ok_digit(&header, 2),
        renewed_count: count(&header, 3, 4),
        unrenewed_count: count(&header, 7, 4),
        transaction_date: text(&header, 11, 18),
        institution_id: d.take("AO"),
        patron_barcode: d.take("AA"),
        renewed_items: d.take_list("BM"),
        unrenewed_items: d.take_list("BN"),
        screen_messages: d.take_list("AF"),
        extensions: d.into_extensions(),
    })
}

/// End Session Response (36).
pub fn parse_end_session(frame: &str) -> Result<EndSessionResponse> {
    expect_code(frame, "36")?;
    let mut d = dissect(frame, 21);
    let header = d.header.clone();
    Ok(EndSessionResponse {
        end_session: flag(&header, 2),
        transaction_date: text(&header, 3, 18),
        institution_id: d.take("AO"),
        patron_barcode: d.take("AA"),
        print_line: d.take("AG"),
        screen_messages: d.take_list("AF"),
        extensions: d.into_extensions(),
    })
}

/// ACS Status Response (98).
pub fn parse_acs_status(frame: &str) -> Result<AcsStatusResponse> {
    expect_code(frame, "98")?;
    let mut d = dissect(frame, 36);
    let header = d.header.clone();
    Ok(AcsStatusResponse {
        on_line: flag(&header, 2),
        checkin_ok: flag(&header, 3),
        checkout_ok: flag(&header, 4),
        acs_renewal_policy: flag(&header, 5),
        status_update_ok: flag(&header, 6),
        offline_ok: flag(&header, 7),
        timeout_period: count(&header, 8, 3),
        retries_allowed: count(&header, 11, 3),
        date_time_sync: text(&header, 14, 18),
        protocol_version: text(&header, 32, 4),
        institution_id: d.take("AO"),
        library_name: d.take("AM"),
        supported_messages: d.take("BX"),
        terminal_location: d.take("AN"),
        screen_messages: d.take_list("AF"),
        extensions: d.into_extensions(),
    })
}

/// Item Status Update Response (20).
pub fn parse_item_status_update(frame: &str) -> Result<ItemStatusUpdateResponse> {
    expect_code(frame, "20")?;
    let mut d = dissect(frame, 21);
    let header = d.header.clone();
    Ok(ItemStatusUpdateResponse {
        item_properties_ok: ok_digit(&header, 2),
        transaction_date: text(&header, 3, 18),
        institution_id: d.take("AO"),
        item_barcode: d.take("AB"),
        title_identifier: d.take("AJ"),
        print_line: d.take("AG"),
        screen_messages: d.take_list("AF"),
        extensions: d.into_extensions(),
    })
}

/// Parse any supported response frame, dispatching on the command code.
pub fn parse_response(frame: &str) -> Result<Response> {
    let code: String = frame.chars().take(2).collect();
    match code.as_str() {
        "24" => parse_patron_status(frame).map(Response::PatronStatus),
        "26" => parse_patron_enable(frame).map(Response::PatronStatus),
        "12" => parse_checkout(frame).map(Response::Checkout),
        "30" => parse_renew(frame).map(Response::Checkout),
        "10" => parse_checkin(frame).map(Response::Checkin),
        "18" => parse_item_information(frame).map(Response::ItemInformation),
        "38" => parse_fee_paid(frame).map(Response::FeePaid),
        "64" => parse_patron_information(frame).map(Response::PatronInformation),
        "16" => parse_hold(frame).map(Response::Hold),
        "66" => parse_renew_all(frame).map(Response::RenewAll),
        "36" => parse_end_session(frame).map(Response::EndSession),
        "98" => parse_acs_status(frame).map(Response::AcsStatus),
        "20" => parse_item_status_update(frame).map(Response::ItemStatusUpdate),
        _ => Err(Sip2Error::UnexpectedResponseCode { expected: "a supported response", got: code }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip2::checksum;

    fn framed(body: &str) -> String {
        checksum::append(body, 1).unwrap()
    }

    #[test]
    fn test_patron_status_full() {
        let body = "24              00120240101    120000AOMAIN|AAVALID001|AEAlice Valid|BLY|BZ0001|CA0000|CB0003|";
        let r = parse_patron_status(&framed(body)).unwrap();
        assert_eq!(r.language, "001");
        assert_eq!(r.transaction_date, "20240101    120000");
        assert_eq!(r.institution_id, "MAIN");
        assert_eq!(r.patron_barcode, "VALID001");
        assert_eq!(r.patron_name, "Alice Valid");
        assert!(r.valid_patron);
        assert_eq!(r.hold_items_count, 1);
        assert_eq!(r.overdue_items_count, 0);
        assert_eq!(r.charged_items_count, 3);
        assert!(!r.flags.charge_privileges_denied);
        assert!(!r.flags.card_reported_lost);
        assert!(r.extensions.is_none());
    }

    #[test]
    fn test_patron_status_flags_positions() {
        // Y at positions 0 (charge denied) and 4 (card lost) of the 14-byte run
        let body = "24Y   Y         00120240101    120000AOMAIN|AAP1|";
        let r = parse_patron_status(&framed(body)).unwrap();
        assert!(r.flags.charge_privileges_denied);
        assert!(r.flags.card_reported_lost);
        assert!(!r.flags.renewal_privileges_denied);
    }

    #[test]
    fn test_first_segment_inline_field() {
        // AA directly after the fixed header, no pipe in between
        let body = "24              00120240101    120000AAVALID001|AEAlice|";
        let r = parse_patron_status(&framed(body)).unwrap();
        assert_eq!(r.patron_barcode, "VALID001");
        assert_eq!(r.patron_name, "Alice");
    }

    #[test]
    fn test_unknown_tags_go_to_extensions() {
        let body = "24              00120240101    120000AOMAIN|AAP1|XZvendor|ZZ42|";
        let r = parse_patron_status(&framed(body)).unwrap();
        let ext = r.extensions.unwrap();
        assert_eq!(ext.get("XZ").unwrap(), "vendor");
        assert_eq!(ext.get("ZZ").unwrap(), "42");
        assert!(!ext.contains_key("AY"));
        assert!(!ext.contains_key("AO"));
    }

    #[test]
    fn test_repeated_screen_messages_kept_in_order() {
        let body = "12120240101    120000AOMAIN|AFfirst|AFsecond|AFthird|";
        let r = parse_checkout(&framed(body)).unwrap();
        assert_eq!(r.screen_messages, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_checkout_ok_and_fields() {
        let body = "121YNY20240101    120000AOMAIN|AAP1|ABI1|AJThe Title|AH20240201    235959|";
        let r = parse_checkout(&framed(body)).unwrap();
        assert!(r.ok);
        assert!(r.renewal_ok);
        assert!(!r.magnetic_media);
        assert!(r.desensitize);
        assert_eq!(r.title_identifier, "The Title");
        assert_eq!(r.due_date, "20240201    235959");
    }

    #[test]
    fn test_checkout_rejected_with_screen_message() {
        let body = "120NNN20240101    120000AOMAIN|AAP1|ABI1|AFPatron blocked|";
        let r = parse_checkout(&framed(body)).unwrap();
        assert!(!r.ok);
        assert_eq!(r.screen_messages, vec!["Patron blocked"]);
    }

    #[test]
    fn test_renew_shares_checkout_layout() {
        let body = "301YNN20240101    120000AOMAIN|AAP1|ABI1|";
        let r = parse_renew(&framed(body)).unwrap();
        assert!(r.ok);
        // and the 12 parser refuses the 30 code
        match parse_checkout(&framed(body)) {
            Err(Sip2Error::UnexpectedResponseCode { expected: "12", got }) => {
                assert_eq!(got, "30");
            }
            other => panic!("expected UnexpectedResponseCode, got {:?}", other),
        }
    }

    #[test]
    fn test_code_mismatch() {
        match parse_patron_status("12...") {
            Err(Sip2Error::UnexpectedResponseCode { expected: "24", got }) => {
                assert_eq!(got, "12");
            }
            other => panic!("expected UnexpectedResponseCode, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_frame_defaults() {
        let r = parse_patron_status("24").unwrap();
        assert_eq!(r.patron_barcode, "");
        assert_eq!(r.hold_items_count, 0);
        assert!(!r.valid_patron);
        assert!(r.screen_messages.is_empty());
        assert!(r.extensions.is_none());
    }

    #[test]
    fn test_patron_information_counts() {
        let body = "64              00120240101    120000000200010003000000000005AOMAIN|AAP1|AEBob|BLY|ATod1|ATod2|AUch1|";
        let r = parse_patron_information(&framed(body)).unwrap();
        assert_eq!(r.hold_items_count, 2);
        assert_eq!(r.overdue_items_count, 1);
        assert_eq!(r.charged_items_count, 3);
        assert_eq!(r.fine_items_count, 0);
        assert_eq!(r.recall_items_count, 0);
        assert_eq!(r.unavailable_holds_count, 5);
        assert_eq!(r.overdue_items, vec!["od1", "od2"]);
        assert_eq!(r.charged_items, vec!["ch1"]);
    }

    #[test]
    fn test_counts_with_leading_spaces() {
        let body = "24              00120240101    120000AOMAIN|BZ   7|";
        let r = parse_patron_status(&framed(body)).unwrap();
        assert_eq!(r.hold_items_count, 7);
    }

    #[test]
    fn test_acs_status() {
        let body = "98YYYNYN10000320240101    1200002.00AOMAIN|AMCentral Library|BX YYYYYYYYYYYYYYYY|";
        let r = parse_acs_status(&framed(body)).unwrap();
        assert!(r.on_line);
        assert!(r.checkin_ok);
        assert!(r.checkout_ok);
        assert!(!r.acs_renewal_policy);
        assert!(r.status_update_ok);
        assert!(!r.offline_ok);
        assert_eq!(r.timeout_period, 100);
        assert_eq!(r.retries_allowed, 3);
        assert_eq!(r.protocol_version, "2.00");
        assert_eq!(r.library_name, "Central Library");
    }

    #[test]
    fn test_renew_all_lists() {
        let body = "6610002001120240101    120000AOMAIN|BMitem1|BMitem2|BNitem3|";
        let r = parse_renew_all(&framed(body)).unwrap();
        assert!(r.ok);
        assert_eq!(r.renewed_count, 2);
        assert_eq!(r.unrenewed_count, 11);
        assert_eq!(r.renewed_items, vec!["item1", "item2"]);
        assert_eq!(r.unrenewed_items, vec!["item3"]);
    }

    #[test]
    fn test_hold_response() {
        let body = "161Y20240101    120000AOMAIN|AAP1|ABI1|BW20251231    235959|BSFront Desk|";
        let r = parse_hold(&framed(body)).unwrap();
        assert!(r.ok);
        assert!(r.available);
        assert_eq!(r.expiration_date, "20251231    235959");
        assert_eq!(r.pickup_location, "Front Desk");
    }

    #[test]
    fn test_frame_without_trailer_parses() {
        // some legacy systems omit the trailer entirely
        let body = "101YNN20240101    120000AOMAIN|ABI1|AJTitle|";
        let r = parse_checkin(body).unwrap();
        assert!(r.ok);
        assert_eq!(r.item_barcode, "I1");
    }

    #[test]
    fn test_dispatch() {
        let body = "36Y20240101    120000AOMAIN|AAP1|";
        match parse_response(&framed(body)).unwrap() {
            Response::EndSession(r) => assert!(r.end_session),
            other => panic!("wrong variant: {:?}", other),
        }
        assert!(parse_response("55nonsense").is_err());
    }

    #[test]
    fn test_non_repeated_tag_takes_first_occurrence() {
        let body = "24              00120240101    120000AOMAIN|AOSECOND|AAP1|";
        let r = parse_patron_status(&framed(body)).unwrap();
        assert_eq!(r.institution_id, "MAIN");
    }
}
