//! Checks applied to user input before any mutation reaches an inspector.

use mongodb::bson::{Bson, Document};

use crate::error::{ExplorerError, ExplorerResult};

/// Characters MongoDB rejects in database names
pub const FORBIDDEN_DATABASE_CHARS: &[char] =
    &['/', '\\', '.', ' ', '"', '$', '*', '<', '>', ':', '|', '?'];

/// Characters MongoDB rejects in collection names
pub const FORBIDDEN_COLLECTION_CHARS: &[char] = &['$'];

fn forbidden_in(input: &str, forbidden: &[char]) -> Vec<String> {
    input
        .chars()
        .filter(|c| forbidden.contains(c))
        .map(|c| c.to_string())
        .collect()
}

pub fn validate_database<'a>(
    input: &str,
    existing: impl IntoIterator<Item = &'a str>,
) -> ExplorerResult<()> {
    if input.is_empty() {
        return Err(ExplorerError::validation("Database name can not be empty"));
    }

    let invalid = forbidden_in(input, FORBIDDEN_DATABASE_CHARS);
    if !invalid.is_empty() {
        return Err(ExplorerError::validation(format!(
            "Database name contains invalid characters ('{}')",
            invalid.join("', '")
        )));
    }

    if existing.into_iter().any(|name| name == input) {
        return Err(ExplorerError::validation(format!(
            "Database '{input}' already exists"
        )));
    }

    Ok(())
}

pub fn validate_collection<'a>(
    input: &str,
    existing: impl IntoIterator<Item = &'a str>,
) -> ExplorerResult<()> {
    if input.is_empty() {
        return Err(ExplorerError::validation("Collection name can not be empty"));
    }
    if input.starts_with("system.") {
        return Err(ExplorerError::validation(
            "Collection names can not start with `system.`",
        ));
    }

    let invalid = forbidden_in(input, FORBIDDEN_COLLECTION_CHARS);
    if !invalid.is_empty() {
        return Err(ExplorerError::validation(format!(
            "Collection names can not include these characters: '{}'",
            invalid.join("', '")
        )));
    }

    if existing.into_iter().any(|name| name == input) {
        return Err(ExplorerError::validation(format!(
            "Collection '{input}' already exists"
        )));
    }

    Ok(())
}

/// Parse user-supplied JSON into a document. Only JSON objects are accepted.
pub fn parse_document(input: &str) -> ExplorerResult<Document> {
    if input.trim().is_empty() {
        return Err(ExplorerError::validation("Enter json object"));
    }

    let value: serde_json::Value = serde_json::from_str(input)
        .map_err(|_| ExplorerError::validation("Not a valid json object"))?;

    // Extended JSON ({"$oid": ...}) is mapped to BSON types here
    match Bson::try_from(value) {
        Ok(Bson::Document(document)) => Ok(document),
        Ok(_) => Err(ExplorerError::validation("Not a valid json object")),
        Err(e) => Err(ExplorerError::validation(format!(
            "Not a valid json object: {e}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_names() {
        assert!(validate_database("app", []).is_ok());
        assert_eq!(
            validate_database("", []).unwrap_err().to_string(),
            "Database name can not be empty"
        );
        assert_eq!(
            validate_database("my.db$", []).unwrap_err().to_string(),
            "Database name contains invalid characters ('.', '$')"
        );
        assert_eq!(
            validate_database("app", ["admin", "app"]).unwrap_err().to_string(),
            "Database 'app' already exists"
        );
        assert!(validate_database("a b", []).unwrap_err().is_client_error());
    }

    #[test]
    fn test_collection_names() {
        assert!(validate_collection("users.archive", []).is_ok());
        assert!(validate_collection("", []).is_err());
        assert_eq!(
            validate_collection("system.profile", []).unwrap_err().to_string(),
            "Collection names can not start with `system.`"
        );
        assert_eq!(
            validate_collection("a$b", []).unwrap_err().to_string(),
            "Collection names can not include these characters: '$'"
        );
        assert!(validate_collection("users", ["users"]).is_err());
    }

    #[test]
    fn test_parse_document() {
        let parsed = parse_document(r#"{"a":1,"b":"x"}"#).unwrap();
        assert!(matches!(parsed.get("a"), Some(Bson::Int32(1) | Bson::Int64(1))));
        assert_eq!(parsed.get_str("b").unwrap(), "x");
        assert!(parse_document("").is_err());
        assert!(parse_document("[1, 2]").is_err());
        assert!(parse_document("{a:1}").is_err());
        assert!(parse_document("42").is_err());

        let doc = parse_document(r#"{"_id": {"$oid": "507f1f77bcf86cd799439011"}}"#).unwrap();
        assert!(matches!(doc.get("_id"), Some(Bson::ObjectId(_))));
    }
}
