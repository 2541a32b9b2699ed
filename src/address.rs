//! Syntactic classification of Zcash addresses
//!
//! Advisory pre-filter only. A string that passes here can still be rejected
//! by the node (bad checksum, wrong network), so anything that moves funds
//! also goes through `z_validateaddress` on the gateway.
//!
//! ## Accepted forms
//!
//! ```text
//! u1<50..=95 alnum>     unified address
//! z<50..=95 alnum>      legacy shielded (Sapling / Sprout)
//! t1|t3|tm|t2<33 alnum> transparent (classified, never accepted)
//! ```

use serde::Serialize;

const SHIELDED_BODY_MIN: usize = 50;
const SHIELDED_BODY_MAX: usize = 95;
const TRANSPARENT_LEN: usize = 35;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    Shielded,
    Transparent,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressForm {
    Unified,
    Legacy,
}

/// Result of [`validate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AddressCheck {
    /// True only for addresses accepted as settlement counterparties
    pub valid: bool,
    pub kind: AddressKind,
    /// Present for shielded addresses
    pub form: Option<AddressForm>,
}

impl AddressCheck {
    fn invalid() -> Self {
        Self {
            valid: false,
            kind: AddressKind::Invalid,
            form: None,
        }
    }
}

/// Classify an address by prefix and length envelope.
pub fn validate(address: &str) -> AddressCheck {
    if !address.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return AddressCheck::invalid();
    }

    if let Some(body) = address.strip_prefix("u1") {
        return shielded(body, AddressForm::Unified);
    }
    if let Some(body) = address.strip_prefix('z') {
        return shielded(body, AddressForm::Legacy);
    }
    if is_transparent(address) {
        return AddressCheck {
            valid: false,
            kind: AddressKind::Transparent,
            form: None,
        };
    }

    AddressCheck::invalid()
}

/// Shorthand for `validate(address).valid`
pub fn is_shielded(address: &str) -> bool {
    validate(address).valid
}

fn shielded(body: &str, form: AddressForm) -> AddressCheck {
    if (SHIELDED_BODY_MIN..=SHIELDED_BODY_MAX).contains(&body.len()) {
        AddressCheck {
            valid: true,
            kind: AddressKind::Shielded,
            form: Some(form),
        }
    } else {
        AddressCheck::invalid()
    }
}

fn is_transparent(address: &str) -> bool {
    address.len() == TRANSPARENT_LEN
        && ["t1", "t3", "tm", "t2"]
            .iter()
            .any(|prefix| address.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAPLING: &str =
        "zs1z7rejlpsa98s2rrrfkwmaxu53e4ue0ulcrw0h4x5g8jl04tak0d3mm47vdtahatqrlkngh9sly";
    const UNIFIED: &str = "u1l8xunezsvhq8fgzfl7404m450nwnd76zshscn6nfys7vyz2ywyh4cc5daaq0c7q2su5lqfh23sp7fkf3kt27ve59";
    const TRANSPARENT: &str = "t1Rv4exT7bqhZqi2j7xz8bUHDMxwosrjADU";

    #[test]
    fn test_sapling_is_shielded_legacy() {
        let check = validate(SAPLING);
        assert!(check.valid);
        assert_eq!(check.kind, AddressKind::Shielded);
        assert_eq!(check.form, Some(AddressForm::Legacy));
    }

    #[test]
    fn test_unified_is_shielded_unified() {
        let check = validate(UNIFIED);
        assert!(check.valid);
        assert_eq!(check.form, Some(AddressForm::Unified));
    }

    #[test]
    fn test_transparent_is_classified_but_rejected() {
        let check = validate(TRANSPARENT);
        assert!(!check.valid);
        assert_eq!(check.kind, AddressKind::Transparent);
        assert!(!is_shielded(TRANSPARENT));
    }

    #[test]
    fn test_length_envelope() {
        let short = format!("z{}", "a".repeat(49));
        let min = format!("z{}", "a".repeat(50));
        let max = format!("u1{}", "a".repeat(95));
        let long = format!("u1{}", "a".repeat(96));
        assert!(!is_shielded(&short));
        assert!(is_shielded(&min));
        assert!(is_shielded(&max));
        assert!(!is_shielded(&long));
    }

    #[test]
    fn test_rejects_non_alphanumeric() {
        let with_dash = format!("zs1{}-", "a".repeat(60));
        assert_eq!(validate(&with_dash).kind, AddressKind::Invalid);
        assert_eq!(validate("").kind, AddressKind::Invalid);
        assert_eq!(validate("0xdeadbeef").kind, AddressKind::Invalid);
    }
}
