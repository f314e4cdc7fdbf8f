//! The reference manifests tiles and models are stored as.
//!
//! The real binary decoders (ADT, M2, BLP) live outside of the streaming core, which only needs to
//! know which other assets a payload references. A manifest is UTF-8 text with one directive per
//! line:
//!
//! ```text
//! # comment
//! texture tileset/elwynn/elwynngrassbase.blp
//! model world/azeroth/elwynn/passivedoodads/trees/elwynntreecanopy01.m2
//! ```

use itertools::Itertools;

use crate::cache::canonicalize_path;
use crate::loading::DecodeError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceManifest {
    pub textures: Vec<String>,
    pub models: Vec<String>,
}

impl ReferenceManifest {
    pub fn reference_count(&self) -> usize {
        self.textures.len() + self.models.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.textures
            .iter()
            .map(|texture| format!("texture {}", texture))
            .chain(self.models.iter().map(|model| format!("model {}", model)))
            .join("\n")
            .into_bytes()
    }
}

/// References are deduplicated (in order of first appearance) and canonicalized.
pub fn parse_manifest(identity: &str, bytes: &[u8]) -> Result<ReferenceManifest, DecodeError> {
    let corrupt = |reason: String| DecodeError::Corrupt {
        identity: identity.to_string(),
        reason,
    };

    let text = std::str::from_utf8(bytes).map_err(|err| corrupt(err.to_string()))?;
    let mut manifest = ReferenceManifest::default();

    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (directive, path) = line
            .split_once(char::is_whitespace)
            .map(|(directive, path)| (directive, path.trim()))
            .ok_or_else(|| corrupt(format!("line {}: missing reference", number + 1)))?;

        let list = match directive {
            "texture" => &mut manifest.textures,
            "model" => &mut manifest.models,
            unknown => {
                return Err(corrupt(format!(
                    "line {}: unknown directive {}",
                    number + 1,
                    unknown
                )));
            }
        };

        let path = canonicalize_path(path);
        if !list.contains(&path) {
            list.push(path);
        }
    }

    Ok(manifest)
}

/// Textures are opaque to the core, as long as there is something to upload.
pub fn decode_texture(identity: &str, bytes: Vec<u8>) -> Result<Vec<u8>, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Corrupt {
            identity: identity.to_string(),
            reason: "empty texture".into(),
        });
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_references() {
        let manifest = parse_manifest(
            "tile",
            b"# Elwynn\ntexture Tileset\\Elwynn\\Grass.blp\n\nmodel trees/tree01.m2\ntexture tileset/elwynn/grass.BLP\n",
        )
        .unwrap();

        assert_eq!(manifest.textures, vec!["tileset/elwynn/grass.blp"]);
        assert_eq!(manifest.models, vec!["trees/tree01.m2"]);
        assert_eq!(manifest.reference_count(), 2);
    }

    #[test]
    fn manifests_survive_serialization() {
        let manifest = ReferenceManifest {
            textures: vec!["a.blp".into()],
            models: vec!["b.m2".into(), "c.m2".into()],
        };
        assert_eq!(parse_manifest("x", &manifest.to_bytes()).unwrap(), manifest);
    }

    #[test]
    fn rejects_unknown_directives() {
        let err = parse_manifest("world/maps/test/test_0_0.adt", b"texture a.blp\nwater 12").unwrap_err();
        assert!(matches!(err, DecodeError::Corrupt { .. }));
        assert!(err.to_string().contains("test_0_0.adt"));
    }

    #[test]
    fn rejects_invalid_utf8_and_empty_textures() {
        assert!(parse_manifest("x", &[0xff, 0xfe]).is_err());
        assert!(decode_texture("x", vec![]).is_err());
        assert_eq!(decode_texture("x", vec![1, 2]).unwrap(), vec![1, 2]);
    }
}
