//! Index partitioning by the year embedded in a document id.
//!
//! Upstream ids look like `EPA-HQ-OAR-2017-0355-0001`: the first token that
//! reads as a plausible year picks the index segment. Ids without one land in
//! the `0000` partition.

/// Partition used when no year can be found in the id.
pub const DEFAULT_PARTITION: &str = "0000";

/// Lowest accepted year.
pub const MIN_PARTITION_YEAR: u16 = 1800;

/// Highest accepted year.
///
/// Fixed rather than derived from the clock so that the same id always maps
/// to the same partition.
pub const MAX_PARTITION_YEAR: u16 = 2199;

/// Derive the partition key for a document id.
///
/// Only tokens of exactly four ASCII digits are considered, so sequence
/// numbers such as `000123` or `2017001` never masquerade as years.
pub fn partition_key(document_id: &str) -> String {
    document_id
        .split('-')
        .filter(|token| token.len() == 4 && token.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|token| token.parse::<u16>().ok())
        .find(|year| (MIN_PARTITION_YEAR..=MAX_PARTITION_YEAR).contains(year))
        .map(|year| format!("{year:04}"))
        .unwrap_or_else(|| DEFAULT_PARTITION.to_string())
}

/// Full index name for a document: `prefix` followed by its partition key.
pub fn index_name(prefix: &str, document_id: &str) -> String {
    format!("{prefix}{}", partition_key(document_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_year_in_middle() {
        assert_eq!(partition_key("EPA-HQ-2017-000123"), "2017");
        assert_eq!(partition_key("EPA-HQ-OAR-2017-0355-0001"), "2017");
    }

    #[test]
    fn test_first_plausible_year_wins() {
        assert_eq!(partition_key("FDA-1999-N-2001"), "1999");
        // 0355 is four digits but out of range, so 2003 is picked
        assert_eq!(partition_key("NRC-0355-2003-0001"), "2003");
    }

    #[test]
    fn test_no_year() {
        assert_eq!(partition_key("EPA-HQ-OAR"), DEFAULT_PARTITION);
        assert_eq!(partition_key(""), DEFAULT_PARTITION);
        assert_eq!(partition_key("doc-42"), DEFAULT_PARTITION);
    }

    #[test]
    fn test_out_of_range_and_wrong_width() {
        assert_eq!(partition_key("X-1799-Y"), DEFAULT_PARTITION);
        assert_eq!(partition_key("X-2200-Y"), DEFAULT_PARTITION);
        assert_eq!(partition_key("X-02017-Y"), DEFAULT_PARTITION);
        assert_eq!(partition_key("X-+201-Y"), DEFAULT_PARTITION);
    }

    #[test]
    fn test_deterministic() {
        let id = "DOT-OST-2014-0031-0042";
        assert_eq!(partition_key(id), partition_key(id));
    }

    #[test]
    fn test_index_name() {
        assert_eq!(index_name("regulations-", "EPA-HQ-2017-000123"), "regulations-2017");
        assert_eq!(index_name("regulations-", "nothing"), "regulations-0000");
    }
}
