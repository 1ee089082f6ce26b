use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{
    TagError, CORES_KEY, FIELD_SEPARATOR, MEMORY_KEY, RESOURCES_CLOSE_TAG, RESOURCES_START_TAG,
    RUNTIME_KEY,
};

/// Resource requirements a scheduler may apply to a single job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTag {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_minutes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
}

impl ResourceTag {
    pub fn new(runtime_minutes: Option<u64>, cores: Option<u32>, memory_mb: Option<u64>) -> Self {
        Self {
            runtime_minutes,
            cores,
            memory_mb,
        }
    }

    pub fn with_runtime_minutes(mut self, minutes: u64) -> Self {
        self.runtime_minutes = Some(minutes);
        self
    }

    pub fn with_cores(mut self, cores: u32) -> Self {
        self.cores = Some(cores);
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = Some(memory_mb);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.runtime_minutes.is_none() && self.cores.is_none() && self.memory_mb.is_none()
    }

    /// Appends this tag to `name`.
    ///
    /// An empty tag leaves the name untouched. Names that already contain
    /// either marker are rejected, since the result could not be decoded
    /// unambiguously.
    pub fn annotate(&self, name: &str) -> Result<String, TagError> {
        if let Some(sentinel) = find_sentinel(name) {
            return Err(TagError::ReservedSentinel {
                name: name.to_string(),
                sentinel,
            });
        }

        if self.is_empty() {
            return Ok(name.to_string());
        }

        Ok(format!("{}{}", name, self))
    }

    fn body(&self) -> String {
        let mut fields = Vec::with_capacity(3);
        if let Some(minutes) = self.runtime_minutes {
            fields.push(format!("{}={}", RUNTIME_KEY, minutes));
        }
        if let Some(cores) = self.cores {
            fields.push(format!("{}={}", CORES_KEY, cores));
        }
        if let Some(mem) = self.memory_mb {
            fields.push(format!("{}={}", MEMORY_KEY, mem));
        }
        fields.join(&FIELD_SEPARATOR.to_string())
    }
}

/// Renders the full delimited segment, or nothing for an empty tag.
impl fmt::Display for ResourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        write!(
            f,
            "{}{}{}",
            RESOURCES_START_TAG,
            self.body(),
            RESOURCES_CLOSE_TAG
        )
    }
}

/// Parses the body found between the markers, e.g. `runtime=30;mem=8000`.
impl FromStr for ResourceTag {
    type Err = TagError;

    fn from_str(body: &str) -> Result<Self, Self::Err> {
        if body.is_empty() {
            return Err(TagError::Empty);
        }

        let mut tag = ResourceTag::default();
        for field in body.split(FIELD_SEPARATOR) {
            let (key, value) = field
                .split_once('=')
                .filter(|(k, v)| !k.is_empty() && !v.is_empty())
                .ok_or_else(|| TagError::MalformedField {
                    field: field.to_string(),
                })?;

            match key {
                RUNTIME_KEY => set_once(&mut tag.runtime_minutes, key, value)?,
                CORES_KEY => set_once(&mut tag.cores, key, value)?,
                MEMORY_KEY => set_once(&mut tag.memory_mb, key, value)?,
                other => {
                    return Err(TagError::UnknownKey {
                        key: other.to_string(),
                    })
                }
            }
        }

        Ok(tag)
    }
}

fn set_once<T: FromStr>(slot: &mut Option<T>, key: &str, value: &str) -> Result<(), TagError> {
    if slot.is_some() {
        return Err(TagError::DuplicateKey {
            key: key.to_string(),
        });
    }
    let invalid = || TagError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    };
    // only the canonical decimal form the encoder writes
    if !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let parsed = value.parse::<T>().map_err(|_| invalid())?;
    *slot = Some(parsed);
    Ok(())
}

fn find_sentinel(name: &str) -> Option<&'static str> {
    [RESOURCES_START_TAG, RESOURCES_CLOSE_TAG]
        .into_iter()
        .find(|sentinel| name.contains(sentinel))
}

/// True when `name` contains either reserved marker.
pub fn contains_sentinel(name: &str) -> bool {
    find_sentinel(name).is_some()
}

/// Appends the given resources to `name`. Absent fields are skipped; with no
/// fields at all the name comes back unchanged.
pub fn encode(
    name: &str,
    runtime_minutes: Option<u64>,
    cores: Option<u32>,
    memory_mb: Option<u64>,
) -> Result<String, TagError> {
    ResourceTag::new(runtime_minutes, cores, memory_mb).annotate(name)
}

/// Extracts the annotation from `name`.
///
/// `Ok(None)` means the name carries no annotation. A start marker without a
/// matching close marker, or a body that does not parse, is an error.
pub fn decode(name: &str) -> Result<Option<ResourceTag>, TagError> {
    let Some((body, _)) = locate(name)? else {
        return Ok(None);
    };
    body.parse().map(Some)
}

/// Returns `name` without its annotation segment. Names without one, or with
/// a broken one, are returned as given.
pub fn strip(name: &str) -> String {
    match locate(name) {
        Ok(Some((_, range))) => {
            let mut out = String::with_capacity(name.len() - range.len());
            out.push_str(&name[..range.start]);
            out.push_str(&name[range.end..]);
            out
        }
        _ => name.to_string(),
    }
}

fn locate(name: &str) -> Result<Option<(&str, std::ops::Range<usize>)>, TagError> {
    let Some(start) = name.find(RESOURCES_START_TAG) else {
        return Ok(None);
    };
    let body_start = start + RESOURCES_START_TAG.len();

    let close = name[body_start..]
        .find(RESOURCES_CLOSE_TAG)
        .map(|offset| body_start + offset)
        .ok_or_else(|| TagError::Unterminated {
            name: name.to_string(),
        })?;
    let end = close + RESOURCES_CLOSE_TAG.len();

    if name[end..].contains(RESOURCES_START_TAG) {
        return Err(TagError::MultipleAnnotations {
            name: name.to_string(),
        });
    }

    Ok(Some((&name[body_start..close], start..end)))
}
