//! Turning a decoded envelope into a store mutation.
//!
//! ```text
//! Create | Update | Read ──▶ User::from_json(after)  ──▶ Upsert(user)
//! Delete                 ──▶ User::from_json(before) ──▶ Delete(id)
//! Unknown(code)          ──────────────────────────────▶ Ignore(code)
//! image absent or null   ──────────────────────────────▶ MissingImage
//! ```
//!
//! A delete from the MongoDB connector carries no `before` unless pre-images are enabled, so
//! a missing image is not a decode failure: there is nothing to apply and the event is
//! acknowledged.
//!
//! Resolution happens before any transaction is opened, so a malformed snapshot never costs
//! a round trip to the database.

use user_sync_core::{ChangeEnvelope, DecodeError, Operation, User};

/// What a change event asks the store to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Insert or overwrite the user
    Upsert(User),
    /// Remove the user with this id
    Delete(String),
    /// Operation code this consumer does not handle
    Ignore(String),
    /// The event has no snapshot for the image its operation reads
    MissingImage {
        /// Operation code of the event
        operation: String,
        /// The snapshot field that was absent (`after` or `before`)
        field: &'static str,
    },
}

impl Mutation {
    /// Resolve `envelope` into a mutation, decoding the snapshot its operation needs.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Entity`] if the snapshot is present but does not decode as a
    /// [`User`].
    pub fn resolve(envelope: &ChangeEnvelope) -> Result<Self, DecodeError> {
        let field = match &envelope.operation {
            Operation::Unknown(code) => return Ok(Self::Ignore(code.clone())),
            Operation::Delete => "before",
            Operation::Create | Operation::Update | Operation::Read => "after",
        };

        let Some(snapshot) = envelope.image() else {
            return Ok(Self::MissingImage {
                operation: envelope.operation.code().to_string(),
                field,
            });
        };
        let user = User::from_json(snapshot)?;

        Ok(if envelope.operation.is_upsert() {
            Self::Upsert(user)
        } else {
            Self::Delete(user.id)
        })
    }

    /// Label used in logs and as a metrics dimension.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Upsert(_) => "upsert",
            Self::Delete(_) => "delete",
            Self::Ignore(_) => "ignore",
            Self::MissingImage { .. } => "missing_image",
        }
    }
}
