use serde::Serialize;

/// モバイルマネー事業者（ザンビア）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MobileOperator {
    Airtel,
    Mtn,
}

impl MobileOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Airtel => "airtel",
            Self::Mtn => "mtn",
        }
    }
}

const COUNTRY_CODE: &str = "260";

/// 国番号を除いた番号のプレフィックス表
const PREFIXES: &[(&str, MobileOperator)] = &[
    ("96", MobileOperator::Airtel),
    ("97", MobileOperator::Airtel),
    ("76", MobileOperator::Airtel),
    ("77", MobileOperator::Airtel),
    ("95", MobileOperator::Mtn),
];

/// 電話番号のプレフィックスから事業者を判定（判定不能時は Airtel）
pub fn detect_operator(phone: &str) -> MobileOperator {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();

    // 国際形式は 260 の後ろ、国内形式は先頭の 0 の後ろを見る
    let national = match digits.strip_prefix(COUNTRY_CODE) {
        Some(rest) => rest,
        None => match digits.strip_prefix('0') {
            Some(rest) => rest,
            None => return MobileOperator::Airtel,
        },
    };

    PREFIXES
        .iter()
        .find(|(prefix, _)| national.starts_with(prefix))
        .map(|(_, operator)| *operator)
        .unwrap_or(MobileOperator::Airtel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_format() {
        assert_eq!(detect_operator("0961234567"), MobileOperator::Airtel);
        assert_eq!(detect_operator("0971234567"), MobileOperator::Airtel);
        assert_eq!(detect_operator("0761234567"), MobileOperator::Airtel);
        assert_eq!(detect_operator("0771234567"), MobileOperator::Airtel);
        assert_eq!(detect_operator("0951234567"), MobileOperator::Mtn);
    }

    #[test]
    fn test_international_format_with_punctuation() {
        assert_eq!(detect_operator("+260 95 123 4567"), MobileOperator::Mtn);
        assert_eq!(detect_operator("+260-97-123-4567"), MobileOperator::Airtel);
        assert_eq!(detect_operator("260771234567"), MobileOperator::Airtel);
    }

    #[test]
    fn test_unknown_defaults_to_airtel() {
        assert_eq!(detect_operator(""), MobileOperator::Airtel);
        assert_eq!(detect_operator("0211234567"), MobileOperator::Airtel);
        assert_eq!(detect_operator("951234567"), MobileOperator::Airtel);
        assert_eq!(detect_operator("not a number"), MobileOperator::Airtel);
    }

    #[test]
    fn test_serializes_lowercase() {
        assert_eq!(serde_json::to_value(MobileOperator::Mtn).unwrap(), "mtn");
        assert_eq!(MobileOperator::Airtel.as_str(), "airtel");
    }
}
