use uuid::Uuid;

pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Mints a locally unique identifier standing in for one the remote store will assign.
/// Shape: `<prefix><millis>_<7 random chars>`.
pub fn new_temp_id(prefix: &str, now_ms: i64) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("{prefix}{now_ms}_{}", &random[..7])
}

pub fn is_temp_id(id: &str, prefix: &str) -> bool {
    !prefix.is_empty() && id.starts_with(prefix)
}
