//! One-shot POST to the region's `UpdateAvatarAppearance` capability and
//! the parsing of its LLSD reply. The retry ladder lives in the pipeline;
//! this module knows nothing about timing.

use crate::appearance::bakes::is_real_texture;
use crate::error::{AppearanceError, Result};
use crate::llsd::{self, Value};
use log::debug;
use std::collections::BTreeMap;
use uuid::Uuid;

/// The reply must carry at least this many texture slots.
pub const MIN_TEXTURE_SLOTS: usize = 21;

/// Baked head/upper/lower/eyes slots that must be populated for success.
const REQUIRED_BAKED_SLOTS: [usize; 4] = [8, 9, 10, 11];

/// Parsed capability reply.
#[derive(Debug, Clone, PartialEq)]
pub enum BakeReply {
    Applied(AppliedAppearance),
    /// The server's COF version disagrees with ours.
    VersionMismatch { expected: i32 },
    /// `success == false`, a malformed reply, or empty bake slots.
    Refused { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppliedAppearance {
    pub visual_params: Vec<u8>,
    pub textures: Vec<Uuid>,
    pub cof_version: i32,
}

pub struct ServerBakeClient {
    http: reqwest::Client,
    url: String,
}

impl ServerBakeClient {
    pub fn new(http: reqwest::Client, url: String) -> Self {
        Self { http, url }
    }

    /// POSTs `{cof_version}` and parses the reply. Transport-level
    /// problems surface as errors; protocol-level refusals as
    /// [`BakeReply`] variants.
    pub async fn update_avatar_appearance(&self, cof_version: i32) -> Result<BakeReply> {
        let mut request = BTreeMap::new();
        request.insert("cof_version".to_string(), Value::Integer(cof_version));
        let body = llsd::to_xml(&Value::Map(request))?;

        let response = self
            .http
            .post(&self.url)
            .header("Content-Type", "application/llsd+xml")
            .body(body)
            .send()
            .await
            .map_err(|e| AppearanceError::Http(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AppearanceError::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(AppearanceError::Http(format!(
                "capability returned HTTP {}",
                status
            )));
        }
        let value = llsd::from_xml(&text)?;
        Ok(parse_reply(&value))
    }
}

/// Applies the §6.3 contract to a decoded reply.
pub fn parse_reply(value: &Value) -> BakeReply {
    if let Some(warnings) = value.get("warnings").and_then(Value::as_array) {
        for warning in warnings {
            debug!("Bake capability warning: {:?}", warning);
        }
    }
    if let Some(expected) = value.get("expected").and_then(Value::as_integer) {
        return BakeReply::VersionMismatch { expected };
    }
    let success = value
        .get("success")
        .and_then(Value::as_boolean)
        .unwrap_or(false);
    if !success {
        let error = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unspecified failure")
            .to_string();
        return BakeReply::Refused { error };
    }

    let Some(texture_values) = value.get("textures").and_then(Value::as_array) else {
        return BakeReply::Refused {
            error: "reply carries no textures".into(),
        };
    };
    if texture_values.len() < MIN_TEXTURE_SLOTS {
        return BakeReply::Refused {
            error: format!(
                "reply carries {} texture slots, expected at least {}",
                texture_values.len(),
                MIN_TEXTURE_SLOTS
            ),
        };
    }
    let textures: Vec<Uuid> = texture_values
        .iter()
        .map(|v| v.as_uuid().unwrap_or_else(Uuid::nil))
        .collect();
    for slot in REQUIRED_BAKED_SLOTS {
        if !is_real_texture(textures[slot]) {
            return BakeReply::Refused {
                error: format!("baked slot {} is empty", slot),
            };
        }
    }

    let visual_params = value
        .get("visual_params")
        .and_then(Value::as_binary)
        .unwrap_or_default()
        .to_vec();
    let cof_version = value
        .get("cof_version")
        .and_then(Value::as_integer)
        .unwrap_or(0);

    BakeReply::Applied(AppliedAppearance {
        visual_params,
        textures,
        cof_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appearance::bakes::DEFAULT_AVATAR_TEXTURE;

    fn reply_with_textures(slot_8_to_11: [Uuid; 4]) -> Value {
        let mut textures = vec![Value::Uuid(Uuid::nil()); MIN_TEXTURE_SLOTS];
        for (offset, id) in slot_8_to_11.into_iter().enumerate() {
            textures[8 + offset] = Value::Uuid(id);
        }
        let mut map = BTreeMap::new();
        map.insert("success".to_string(), Value::Boolean(true));
        map.insert("textures".to_string(), Value::Array(textures));
        map.insert("cof_version".to_string(), Value::Integer(9));
        map.insert(
            "visual_params".to_string(),
            Value::Binary(vec![1, 2, 3]),
        );
        Value::Map(map)
    }

    #[test]
    fn happy_path_applies() {
        let bakes = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        match parse_reply(&reply_with_textures(bakes)) {
            BakeReply::Applied(applied) => {
                assert_eq!(applied.cof_version, 9);
                assert_eq!(applied.visual_params, vec![1, 2, 3]);
                assert_eq!(applied.textures[8], bakes[0]);
            }
            other => panic!("expected Applied, got {:?}", other),
        }
    }

    #[test]
    fn zero_or_sentinel_bake_slot_refuses() {
        let mut bakes = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        bakes[0] = Uuid::nil();
        assert!(matches!(
            parse_reply(&reply_with_textures(bakes)),
            BakeReply::Refused { .. }
        ));
        bakes[0] = DEFAULT_AVATAR_TEXTURE;
        assert!(matches!(
            parse_reply(&reply_with_textures(bakes)),
            BakeReply::Refused { .. }
        ));
    }

    #[test]
    fn expected_version_wins_over_everything() {
        let mut map = BTreeMap::new();
        map.insert("success".to_string(), Value::Boolean(true));
        map.insert("expected".to_string(), Value::Integer(17));
        assert_eq!(
            parse_reply(&Value::Map(map)),
            BakeReply::VersionMismatch { expected: 17 }
        );
    }

    #[test]
    fn explicit_failure_carries_the_error() {
        let mut map = BTreeMap::new();
        map.insert("success".to_string(), Value::Boolean(false));
        map.insert(
            "error".to_string(),
            Value::String("too many textures".into()),
        );
        assert_eq!(
            parse_reply(&Value::Map(map)),
            BakeReply::Refused {
                error: "too many textures".into()
            }
        );
    }

    #[test]
    fn short_texture_array_refuses() {
        let mut map = BTreeMap::new();
        map.insert("success".to_string(), Value::Boolean(true));
        map.insert(
            "textures".to_string(),
            Value::Array(vec![Value::Uuid(Uuid::new_v4()); 4]),
        );
        assert!(matches!(
            parse_reply(&Value::Map(map)),
            BakeReply::Refused { .. }
        ));
    }
}
