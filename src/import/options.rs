//! Request shape checks.
//!
//! Runs before any validation or I/O: every domain name must be owned by a
//! runner, every option must be recognized by that runner and every domain
//! must carry `records`.

use crate::import::domain::DomainKey;
use crate::import::error::{ImportError, UNKNOWN_DOMAINS_KEY, UnknownOptions};
use crate::import::request::{DomainOptions, ImportRequest};

/// Select the domains to import, in registry order.
///
/// Domains with an empty record list are left out. Their options are still
/// checked.
pub fn check_options(
    request: &ImportRequest,
) -> Result<Vec<(DomainKey, &DomainOptions)>, ImportError> {
    let mut unknown = UnknownOptions::new();

    for name in request.domains.keys() {
        if name.parse::<DomainKey>().is_err() {
            unknown
                .entry(UNKNOWN_DOMAINS_KEY.to_string())
                .or_default()
                .insert(name.clone());
        }
    }

    let mut missing = Vec::new();
    let mut selected = Vec::new();

    for key in DomainKey::ALL {
        let Some(options) = request.domains.get(key.as_str()) else {
            continue;
        };
        let descriptor = key.descriptor();

        for option in options.extra.keys() {
            if !descriptor.recognizes_extra(option) {
                unknown
                    .entry(key.as_str().to_string())
                    .or_default()
                    .insert(option.clone());
            }
        }

        match &options.records {
            None => missing.push(key),
            Some(records) if records.is_empty() => {
                log::debug!("{key}: no records, skipping");
            }
            Some(_) => selected.push((key, options)),
        }
    }

    if !unknown.is_empty() {
        return Err(ImportError::UnknownOptions(unknown));
    }
    if !missing.is_empty() {
        return Err(ImportError::MissingParams(missing));
    }

    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn request(value: serde_json::Value) -> ImportRequest {
        serde_json::from_value(value).expect("request json")
    }

    #[test]
    fn unknown_option_on_ignored_domain_is_rejected() {
        let request = request(json!({
            "domains": {"blocks": {"records": [], "extra_option": true}}
        }));

        match check_options(&request) {
            Err(ImportError::UnknownOptions(unknown)) => {
                assert_eq!(
                    unknown,
                    UnknownOptions::from([(
                        "blocks".to_string(),
                        BTreeSet::from(["extra_option".to_string()])
                    )])
                );
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn unknown_domains_are_reported_together_with_options() {
        let request = request(json!({
            "domains": {
                "receipts": {"records": [{}]},
                "logs": {"records": [{}], "chunk_size": 10, "batch": 2}
            }
        }));

        match check_options(&request) {
            Err(ImportError::UnknownOptions(unknown)) => {
                assert_eq!(unknown["domains"], BTreeSet::from(["receipts".to_string()]));
                assert_eq!(unknown["logs"], BTreeSet::from(["batch".to_string()]));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn missing_records_are_reported_per_domain() {
        let request = request(json!({
            "domains": {"transactions": {"timeout": 10}, "logs": {}}
        }));

        match check_options(&request) {
            Err(ImportError::MissingParams(domains)) => {
                assert_eq!(domains, vec![DomainKey::Transactions, DomainKey::Logs]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn unknown_options_win_over_missing_params() {
        let request = request(json!({
            "domains": {"transactions": {}, "blocks": {"records": [], "nope": 1}}
        }));

        assert!(matches!(
            check_options(&request),
            Err(ImportError::UnknownOptions(_))
        ));
    }

    #[test]
    fn empty_domains_are_skipped() {
        let request = request(json!({
            "domains": {
                "transactions": {"records": [{"hash": "0x1"}]},
                "blocks": {"records": []}
            }
        }));

        let selected = check_options(&request).expect("valid shape");
        let keys: Vec<DomainKey> = selected.iter().map(|(key, _)| *key).collect();
        assert_eq!(keys, vec![DomainKey::Transactions]);
    }

    #[test]
    fn chunk_size_is_only_known_to_bulk_domains() {
        let request = request(json!({
            "domains": {"blocks": {"records": [{}], "chunk_size": 2}}
        }));

        assert!(matches!(
            check_options(&request),
            Err(ImportError::UnknownOptions(_))
        ));
    }
}
