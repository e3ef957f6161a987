// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Key/value tags and the pipeline-wide common tag list.

use crate::errors::ConfigError;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Parses `k:v,k2:v2`. Whitespace around entries is trimmed and empty
/// entries are ignored. The value may itself contain `:`.
pub fn parse_tags(input: &str) -> Result<Vec<Tag>, ConfigError> {
    input
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok(Tag::new(key.trim(), value.trim()))
            }
            _ => Err(ConfigError::InvalidTag(entry.to_string())),
        })
        .collect()
}

/// Append-only tag list shared by every channel of one pipeline.
///
/// Cloning yields another handle to the same list.
#[derive(Debug, Clone, Default)]
pub struct CommonTags {
    inner: Arc<RwLock<Vec<Tag>>>,
}

impl CommonTags {
    pub fn new(tags: Vec<Tag>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(tags)),
        }
    }

    pub fn add(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Tag::new(key, value));
    }

    pub fn extend(&self, tags: impl IntoIterator<Item = Tag>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tags);
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Tag> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

/// Record tags followed by every common tag whose key the record does not
/// already carry. Record tags always win.
#[must_use]
pub fn merge<'a>(record_tags: &'a [Tag], common: &'a [Tag]) -> Vec<&'a Tag> {
    let mut merged: Vec<&Tag> = record_tags.iter().collect();
    for tag in common {
        if !merged.iter().any(|existing| existing.key == tag.key) {
            merged.push(tag);
        }
    }
    merged
}

/// Serializes an ordered tag list as a JSON object, preserving order.
pub(crate) struct TagObject<'a>(pub(crate) &'a [&'a Tag]);

impl Serialize for TagObject<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for tag in self.0 {
            map.serialize_entry(&tag.key, &tag.value)?;
        }
        map.end()
    }
}
