//! Raw source payloads and their mapping to stored records

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{IngestError, Result};

/// Raw user payload as returned by the external source
#[derive(Debug, Deserialize, Clone)]
pub struct RawUser {
    pub gender: String,
    pub name: RawName,
    pub location: RawLocation,
    pub email: String,
    pub dob: RawDob,
    pub picture: RawPicture,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RawName {
    pub first: String,
    pub last: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RawLocation {
    pub street: RawStreet,
    pub city: String,
    pub state: String,
    pub country: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RawStreet {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RawDob {
    pub age: Value,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RawPicture {
    pub large: String,
}

/// Envelope of a source response
#[derive(Debug, Deserialize)]
pub struct SourceResponse {
    pub results: Vec<Value>,
}

/// Database model for an ingested user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub gender: String,
    pub name: String,
    pub address: Address,
    pub email: String,
    pub age: String,
    pub picture: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub city: String,
    pub state: String,
    pub country: String,
    pub street: String,
}

impl RawUser {
    /// Convert to database record
    pub fn to_user_record(&self) -> Result<UserRecord> {
        let age = match &self.dob.age {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            other => {
                return Err(IngestError::transform(format!("dob.age is not a number: {other}")))
            }
        };

        Ok(UserRecord {
            gender: self.gender.clone(),
            name: format!("{} {}", self.name.first, self.name.last),
            address: Address {
                city: self.location.city.clone(),
                state: self.location.state.clone(),
                country: self.location.country.clone(),
                street: self.location.street.name.clone(),
            },
            email: self.email.clone(),
            age,
            picture: self.picture.large.clone(),
        })
    }
}

/// Map one raw payload into the storage shape.
///
/// Any missing nested field fails the whole batch.
pub fn transform_user(raw: &Value) -> Result<UserRecord> {
    let user = RawUser::deserialize(raw)
        .map_err(|e| IngestError::transform(format!("malformed user record: {e}")))?;
    user.to_user_record()
}

/// Map a whole batch, stopping at the first malformed record
pub fn transform_batch(raw: &[Value]) -> Result<Vec<UserRecord>> {
    raw.iter().map(transform_user).collect()
}

#[cfg(test)]
pub(crate) fn sample_raw_user(first: &str, last: &str) -> Value {
    serde_json::json!({
        "gender": "female",
        "name": { "title": "Ms", "first": first, "last": last },
        "location": {
            "street": { "number": 8929, "name": "Valwood Pkwy" },
            "city": "Billings",
            "state": "Michigan",
            "country": "United States",
            "postcode": "63104"
        },
        "email": format!("{}.{}@example.com", first.to_lowercase(), last.to_lowercase()),
        "dob": { "date": "1992-03-08T15:13:16.688Z", "age": 30 },
        "picture": {
            "large": "https://randomuser.me/api/portraits/women/60.jpg",
            "thumbnail": "https://randomuser.me/api/portraits/thumb/women/60.jpg"
        }
    })
}
