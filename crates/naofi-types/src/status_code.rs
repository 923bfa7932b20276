/// Status code type alias. Values match the `na_return_t` numbering used by
/// NA plugins so codes can be handed across the plugin boundary unchanged.
#[allow(non_camel_case_types)]
pub type status_code_t = u16;

/// Return codes of the NA plugin operation set.
pub mod NaCode {
    use super::status_code_t;

    pub const SUCCESS: status_code_t = 0;
    pub const TIMEOUT: status_code_t = 1;
    pub const INVALID_PARAM: status_code_t = 2;
    pub const SIZE_ERROR: status_code_t = 3;
    pub const ALIGNMENT_ERROR: status_code_t = 4;
    pub const PERMISSION_ERROR: status_code_t = 5;
    pub const NOMEM_ERROR: status_code_t = 6;
    pub const PROTOCOL_ERROR: status_code_t = 7;
    pub const CANCELED: status_code_t = 8;
}

/// Get a human-readable name for a status code.
pub fn to_string(code: status_code_t) -> &'static str {
    match code {
        NaCode::SUCCESS => "Success",
        NaCode::TIMEOUT => "Timeout",
        NaCode::INVALID_PARAM => "InvalidParam",
        NaCode::SIZE_ERROR => "SizeError",
        NaCode::ALIGNMENT_ERROR => "AlignmentError",
        NaCode::PERMISSION_ERROR => "PermissionError",
        NaCode::NOMEM_ERROR => "NomemError",
        NaCode::PROTOCOL_ERROR => "ProtocolError",
        NaCode::CANCELED => "Canceled",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_string() {
        assert_eq!(to_string(NaCode::SUCCESS), "Success");
        assert_eq!(to_string(NaCode::PROTOCOL_ERROR), "ProtocolError");
        assert_eq!(to_string(NaCode::CANCELED), "Canceled");
        assert_eq!(to_string(4242), "Unknown");
    }

    #[test]
    fn test_codes_are_distinct() {
        let codes = [
            NaCode::SUCCESS,
            NaCode::TIMEOUT,
            NaCode::INVALID_PARAM,
            NaCode::SIZE_ERROR,
            NaCode::ALIGNMENT_ERROR,
            NaCode::PERMISSION_ERROR,
            NaCode::NOMEM_ERROR,
            NaCode::PROTOCOL_ERROR,
            NaCode::CANCELED,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
