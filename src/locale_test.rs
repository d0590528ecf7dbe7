use super::*;

fn temp_store() -> LocaleStore {
    let path = std::env::temp_dir().join(format!("authgate-locale-{}.json", uuid::Uuid::new_v4()));
    LocaleStore::new(path)
}

// =============================================================================
// Locale parsing
// =============================================================================

#[test]
fn parses_supported_codes() {
    assert_eq!("en".parse::<Locale>().unwrap(), Locale::En);
    assert_eq!("TR".parse::<Locale>().unwrap(), Locale::Tr);
}

#[test]
fn parses_region_qualified_codes() {
    assert_eq!("en-US".parse::<Locale>().unwrap(), Locale::En);
    assert_eq!("tr_TR".parse::<Locale>().unwrap(), Locale::Tr);
}

#[test]
fn rejects_unsupported_code() {
    let err = "de".parse::<Locale>().unwrap_err();
    assert!(err.to_string().contains("de"));
}

#[test]
fn unknown_code_falls_back_to_english() {
    assert_eq!(Locale::from_code_or_default("fr"), Locale::En);
    assert_eq!(Locale::from_code_or_default(""), Locale::En);
}

#[test]
fn locale_serde_uses_lowercase_code() {
    assert_eq!(serde_json::to_string(&Locale::Tr).unwrap(), "\"tr\"");
}

// =============================================================================
// LocaleStore
// =============================================================================

#[test]
fn missing_file_loads_english() {
    let store = temp_store();
    assert_eq!(store.load(), Locale::En);
}

#[test]
fn saved_locale_is_loaded_back() {
    let store = temp_store();
    store.save(Locale::Tr).unwrap();
    assert_eq!(store.load(), Locale::Tr);

    let raw = std::fs::read_to_string(store.path()).unwrap();
    assert!(raw.contains(LOCALE_KEY));
    std::fs::remove_file(store.path()).unwrap();
}

#[test]
fn save_keeps_unrelated_keys() {
    let store = temp_store();
    std::fs::write(store.path(), r#"{"theme":"dark"}"#).unwrap();
    store.save(Locale::Tr).unwrap();

    let raw = std::fs::read_to_string(store.path()).unwrap();
    let entries: BTreeMap<String, String> = serde_json::from_str(&raw).unwrap();
    assert_eq!(entries.get("theme").map(String::as_str), Some("dark"));
    assert_eq!(entries.get(LOCALE_KEY).map(String::as_str), Some("tr"));
    std::fs::remove_file(store.path()).unwrap();
}

#[test]
fn unknown_stored_value_loads_english() {
    let store = temp_store();
    std::fs::write(store.path(), r#"{"i18nextLng":"xx"}"#).unwrap();
    assert_eq!(store.load(), Locale::En);
    std::fs::remove_file(store.path()).unwrap();
}

#[test]
fn malformed_file_loads_english() {
    let store = temp_store();
    std::fs::write(store.path(), "not json").unwrap();
    assert_eq!(store.load(), Locale::En);
    std::fs::remove_file(store.path()).unwrap();
}

#[test]
fn save_into_missing_directory_reports_path() {
    let dir = std::env::temp_dir().join(format!("authgate-missing-{}", uuid::Uuid::new_v4()));
    let store = LocaleStore::new(dir.join("locale.json"));
    let err = store.save(Locale::En).unwrap_err();
    assert!(matches!(err, LocaleError::Io { .. }));
    assert!(err.to_string().contains("locale.json"));
}
