//! The `User` entity mirrored from the source collection.

use crate::envelope::DecodeError;
use serde::{Deserialize, Serialize};

/// A user as stored in the relational mirror.
///
/// `id` is the source document's `ObjectId` rendered as a string. It is the natural key
/// for upserts and deletes and is never interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    /// Source document identifier (`_id.$oid`)
    pub id: String,
    /// Display name, absent when the document has none
    pub name: Option<String>,
    /// Email address, absent when the document has none
    pub email: Option<String>,
    /// Age, `0` when the document has none
    pub age: i32,
}

impl User {
    /// Create a user with the given identifier and no optional fields.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            email: None,
            age: 0,
        }
    }

    /// Set the name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the email.
    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Set the age.
    #[must_use]
    pub const fn with_age(mut self, age: i32) -> Self {
        self.age = age;
        self
    }

    /// Decode a string-encoded document snapshot.
    ///
    /// The identifier is unwrapped from MongoDB's extended-JSON `{"$oid": "..."}` form.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Entity`] if the snapshot is not valid JSON, is `null`, or has
    /// no `_id.$oid`.
    ///
    /// # Example
    ///
    /// ```
    /// use user_sync_core::User;
    ///
    /// let user = User::from_json(r#"{"_id":{"$oid":"abc123"},"Name":"Alice","Age":30}"#).unwrap();
    /// assert_eq!(user.id, "abc123");
    /// assert_eq!(user.name.as_deref(), Some("Alice"));
    /// assert_eq!(user.email, None);
    /// assert_eq!(user.age, 30);
    /// ```
    pub fn from_json(raw: &str) -> Result<Self, DecodeError> {
        let document: Option<UserDocument> =
            serde_json::from_str(raw).map_err(|e| DecodeError::Entity(e.to_string()))?;
        let document =
            document.ok_or_else(|| DecodeError::Entity("snapshot is null".to_string()))?;
        let id = document
            .id
            .ok_or_else(|| DecodeError::Entity("missing `_id`".to_string()))?;

        Ok(Self {
            id: id.oid,
            name: document.name,
            email: document.email,
            age: document.age.unwrap_or_default(),
        })
    }
}

#[derive(Deserialize)]
struct UserDocument {
    #[serde(default, rename = "_id")]
    id: Option<ObjectId>,
    #[serde(default, rename = "Name", alias = "name")]
    name: Option<String>,
    #[serde(default, rename = "Email", alias = "email")]
    email: Option<String>,
    #[serde(default, rename = "Age", alias = "age")]
    age: Option<i32>,
}

#[derive(Deserialize)]
struct ObjectId {
    #[serde(rename = "$oid")]
    oid: String,
}
