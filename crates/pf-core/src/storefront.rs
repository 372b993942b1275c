//! App Store storefront ids
//!
//! Accounts report their storefront as `<id>-<variant>,<language>`; the id
//! maps to the store country used for purchases.

/// Storefront id to ISO country code, sorted by id
const STOREFRONTS: &[(&str, &str)] = &[
    ("143441", "US"), ("143442", "FR"), ("143443", "DE"), ("143444", "GB"), ("143445", "AT"), ("143446", "BE"),
    ("143447", "FI"), ("143448", "GR"), ("143449", "IE"), ("143450", "IT"), ("143451", "LU"), ("143452", "NL"),
    ("143453", "PT"), ("143454", "ES"), ("143455", "CA"), ("143456", "SE"), ("143457", "NO"), ("143458", "DK"),
    ("143459", "CH"), ("143460", "AU"), ("143461", "NZ"), ("143462", "JP"), ("143463", "HK"), ("143464", "SG"),
    ("143465", "CN"), ("143466", "KR"), ("143467", "IN"), ("143468", "MX"), ("143469", "RU"), ("143470", "TW"),
    ("143471", "VN"), ("143472", "ZA"), ("143473", "MY"), ("143474", "PH"), ("143475", "TH"), ("143476", "ID"),
    ("143477", "PK"), ("143478", "PL"), ("143479", "SA"), ("143480", "TR"), ("143481", "AE"), ("143482", "HU"),
    ("143483", "CL"), ("143484", "NP"), ("143485", "PA"), ("143486", "LK"), ("143487", "RO"), ("143488", "MV"),
    ("143489", "CZ"), ("143490", "BD"), ("143491", "IL"), ("143492", "UA"), ("143493", "KW"), ("143494", "HR"),
    ("143495", "CR"), ("143496", "SK"), ("143497", "LB"), ("143498", "QA"), ("143499", "SI"), ("143500", "RS"),
    ("143501", "CO"), ("143502", "VE"), ("143503", "BR"), ("143504", "GT"), ("143505", "AR"), ("143506", "SV"),
    ("143507", "PE"), ("143508", "DO"), ("143509", "EC"), ("143510", "HN"), ("143511", "JM"), ("143512", "NI"),
    ("143513", "PY"), ("143514", "UY"), ("143515", "MO"), ("143516", "EG"), ("143517", "KZ"), ("143518", "EE"),
    ("143519", "LV"), ("143520", "LT"), ("143521", "MT"), ("143522", "LI"), ("143523", "MD"), ("143524", "AM"),
    ("143525", "BW"), ("143526", "BG"), ("143527", "CI"), ("143528", "JO"), ("143529", "KE"), ("143530", "MK"),
    ("143531", "MG"), ("143532", "ML"), ("143533", "MU"), ("143534", "NE"), ("143535", "SN"), ("143536", "TN"),
    ("143537", "UG"), ("143538", "AI"), ("143539", "BS"), ("143540", "AG"), ("143541", "BB"), ("143542", "BM"),
    ("143543", "VG"), ("143544", "KY"), ("143545", "DM"), ("143546", "GD"), ("143547", "MS"), ("143548", "KN"),
    ("143549", "LC"), ("143550", "VC"), ("143551", "TT"), ("143552", "TC"), ("143553", "GY"), ("143554", "SR"),
    ("143555", "BZ"), ("143556", "BO"), ("143557", "CY"), ("143558", "IS"), ("143559", "BH"), ("143560", "BN"),
    ("143561", "NG"), ("143562", "OM"), ("143563", "DZ"), ("143564", "AO"), ("143565", "BY"), ("143566", "UZ"),
    ("143568", "AZ"), ("143571", "YE"), ("143572", "TZ"), ("143573", "GH"),
];

/// Country code for a storefront id
pub fn country_for_storefront(storefront_id: &str) -> Option<&'static str> {
    STOREFRONTS
        .binary_search_by(|(id, _)| id.cmp(&storefront_id))
        .ok()
        .map(|index| STOREFRONTS[index].1)
}

/// Lowercase store country of an account.
///
/// Uses the storefront id from `AccountStoreFront` (`143443-4,29` -> `143443`)
/// and falls back to the region suffix of the device locale (`de_DE` -> `de`).
pub fn resolve_store_country(store_front: Option<&str>, locale: &str) -> String {
    let storefront_id = store_front
        .and_then(|raw| raw.split(',').next())
        .map(|id| id.split('-').next().unwrap_or(id).trim());

    storefront_id
        .and_then(country_for_storefront)
        .map(str::to_string)
        .unwrap_or_else(|| locale.rsplit('_').next().unwrap_or_default().to_string())
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_sorted() {
        assert!(STOREFRONTS.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_country_for_storefront() {
        assert_eq!(country_for_storefront("143443"), Some("DE"));
        assert_eq!(country_for_storefront("143441"), Some("US"));
        assert_eq!(country_for_storefront("999999"), None);
    }

    #[test]
    fn test_resolve_store_country() {
        assert_eq!(resolve_store_country(Some("143443-4,29"), "en_US"), "de");
        assert_eq!(resolve_store_country(Some("143444,12"), "de_DE"), "gb");
        assert_eq!(resolve_store_country(Some("000000-1,1"), "fr_FR"), "fr");
        assert_eq!(resolve_store_country(None, "en_US"), "us");
    }
}
