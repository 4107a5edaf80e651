//! Format tags and the static capability table used for routing.
//!
//! Every routing decision in the system is a lookup in [`CAPABILITY_TABLE`]:
//! the source format selects a capability class, and the class lists the
//! targets it can produce from that source.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// File format tag handled somewhere in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Docx,
    Pdf,
    Jpg,
    Png,
    Gif,
}

impl Format {
    /// Every format accepted as a conversion target.
    pub const TARGETS: [Format; 5] = [
        Format::Pdf,
        Format::Docx,
        Format::Png,
        Format::Jpg,
        Format::Gif,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Docx => "docx",
            Format::Pdf => "pdf",
            Format::Jpg => "jpg",
            Format::Png => "png",
            Format::Gif => "gif",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Format::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            Format::Pdf => "application/pdf",
            Format::Jpg => "image/jpeg",
            Format::Png => "image/png",
            Format::Gif => "image/gif",
        }
    }

    /// Parses a source format from a file extension.
    ///
    /// Case-insensitive; `jpeg` is an alias of `jpg`.
    pub fn from_extension(ext: &str) -> Option<Format> {
        match ext.to_ascii_lowercase().as_str() {
            "docx" => Some(Format::Docx),
            "pdf" => Some(Format::Pdf),
            "jpg" | "jpeg" => Some(Format::Jpg),
            "png" => Some(Format::Png),
            "gif" => Some(Format::Gif),
            _ => None,
        }
    }

    /// Derives the source format from a filename's last extension.
    pub fn from_filename(filename: &str) -> Option<Format> {
        let (_, ext) = filename.rsplit_once('.')?;
        Format::from_extension(ext)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a caller-supplied target is not one of [`Format::TARGETS`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported target format '{0}' (supported: pdf, docx, png, jpg, gif)")]
pub struct UnknownTarget(pub String);

impl FromStr for Format {
    type Err = UnknownTarget;

    /// Strict target parsing: only the canonical lowercase tags
    /// (surrounding whitespace and case are ignored).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_ascii_lowercase();
        Format::TARGETS
            .iter()
            .copied()
            .find(|f| f.as_str() == tag)
            .ok_or_else(|| UnknownTarget(s.to_string()))
    }
}

/// Named group of backend instances handling a family of source formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityClass {
    Document,
    Image,
}

impl CapabilityClass {
    pub const ALL: [CapabilityClass; 2] = [CapabilityClass::Document, CapabilityClass::Image];

    /// Tag a registered instance carries to advertise this class.
    pub fn tag(&self) -> &'static str {
        match self {
            CapabilityClass::Document => "document",
            CapabilityClass::Image => "image",
        }
    }

    /// Durable queue owned by this class.
    pub fn queue_name(&self) -> &'static str {
        match self {
            CapabilityClass::Document => "convert.document",
            CapabilityClass::Image => "convert.image",
        }
    }

    /// Service name instances of this class register under.
    pub fn service_name(&self) -> &'static str {
        match self {
            CapabilityClass::Document => "convert-document",
            CapabilityClass::Image => "convert-image",
        }
    }

    pub fn routes(&self) -> &'static [Route] {
        CAPABILITY_TABLE
            .iter()
            .find(|entry| entry.class == *self)
            .map(|entry| entry.routes)
            .unwrap_or(&[])
    }

    /// Registry tags: the class tag followed by every handled source format.
    pub fn registry_tags(&self) -> Vec<String> {
        let mut tags = vec![self.tag().to_string()];
        for route in self.routes() {
            let source = route.source.as_str().to_string();
            if !tags.contains(&source) {
                tags.push(source);
            }
        }
        tags
    }
}

impl fmt::Display for CapabilityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for CapabilityClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "document" | "text" => Ok(CapabilityClass::Document),
            "image" => Ok(CapabilityClass::Image),
            other => Err(format!("unknown capability class '{}'", other)),
        }
    }
}

/// One source format and the targets it can be converted to.
#[derive(Debug, Clone, Copy)]
pub struct Route {
    pub source: Format,
    pub targets: &'static [Format],
}

#[derive(Debug, Clone, Copy)]
pub struct CapabilityEntry {
    pub class: CapabilityClass,
    pub routes: &'static [Route],
}

pub const CAPABILITY_TABLE: &[CapabilityEntry] = &[
    CapabilityEntry {
        class: CapabilityClass::Document,
        routes: &[
            Route {
                source: Format::Docx,
                targets: &[Format::Pdf, Format::Png],
            },
            Route {
                source: Format::Pdf,
                targets: &[Format::Docx, Format::Png],
            },
        ],
    },
    CapabilityEntry {
        class: CapabilityClass::Image,
        routes: &[
            Route {
                source: Format::Jpg,
                targets: &[Format::Png, Format::Gif],
            },
            Route {
                source: Format::Png,
                targets: &[Format::Jpg, Format::Gif],
            },
            Route {
                source: Format::Gif,
                targets: &[Format::Jpg, Format::Png],
            },
        ],
    },
];

/// Class whose routes include `source` at all, regardless of target.
pub fn class_for_source(source: Format) -> Option<CapabilityClass> {
    CAPABILITY_TABLE
        .iter()
        .find(|entry| entry.routes.iter().any(|r| r.source == source))
        .map(|entry| entry.class)
}

/// Routing decision for a `(source, target)` pair.
pub fn route(source: Format, target: Format) -> Option<CapabilityClass> {
    CAPABILITY_TABLE
        .iter()
        .find(|entry| {
            entry
                .routes
                .iter()
                .any(|r| r.source == source && r.targets.contains(&target))
        })
        .map(|entry| entry.class)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_every_table_pair_routes_to_its_class() {
        for entry in CAPABILITY_TABLE {
            for r in entry.routes {
                for target in r.targets {
                    assert_eq!(route(r.source, *target), Some(entry.class));
                }
            }
        }
    }

    #[test]
    fn test_document_pairs() {
        assert_eq!(route(Format::Docx, Format::Png), Some(CapabilityClass::Document));
        assert_eq!(route(Format::Docx, Format::Pdf), Some(CapabilityClass::Document));
        assert_eq!(route(Format::Pdf, Format::Docx), Some(CapabilityClass::Document));
        assert_eq!(route(Format::Pdf, Format::Png), Some(CapabilityClass::Document));
    }

    #[test]
    fn test_image_pairs() {
        assert_eq!(route(Format::Png, Format::Jpg), Some(CapabilityClass::Image));
        assert_eq!(route(Format::Jpg, Format::Gif), Some(CapabilityClass::Image));
        assert_eq!(route(Format::Gif, Format::Png), Some(CapabilityClass::Image));
    }

    #[test]
    fn test_unsupported_pairs_have_no_route() {
        assert_eq!(route(Format::Jpg, Format::Pdf), None);
        assert_eq!(route(Format::Png, Format::Docx), None);
        assert_eq!(route(Format::Docx, Format::Docx), None);
        assert_eq!(route(Format::Pdf, Format::Gif), None);
        assert_eq!(route(Format::Png, Format::Png), None);
    }

    #[test]
    fn test_png_source_belongs_to_image_class() {
        // png is both an image source and a document target
        assert_eq!(class_for_source(Format::Png), Some(CapabilityClass::Image));
        assert_eq!(class_for_source(Format::Docx), Some(CapabilityClass::Document));
    }

    #[test]
    fn test_source_from_filename() {
        assert_eq!(Format::from_filename("report.DOCX"), Some(Format::Docx));
        assert_eq!(Format::from_filename("photo.jpeg"), Some(Format::Jpg));
        assert_eq!(Format::from_filename("archive.tar.gz"), None);
        assert_eq!(Format::from_filename("no_extension"), None);
    }

    #[test]
    fn test_target_parsing_is_strict() {
        assert_eq!("PNG".parse::<Format>(), Ok(Format::Png));
        assert_eq!(" pdf ".parse::<Format>(), Ok(Format::Pdf));
        assert!("jpeg".parse::<Format>().is_err());
        assert!("bmp".parse::<Format>().is_err());
        assert!("".parse::<Format>().is_err());
    }

    #[test]
    fn test_registry_tags() {
        assert_eq!(
            CapabilityClass::Document.registry_tags(),
            vec!["document", "docx", "pdf"]
        );
        assert_eq!(
            CapabilityClass::Image.registry_tags(),
            vec!["image", "jpg", "png", "gif"]
        );
    }

    #[test]
    fn test_class_names_are_distinct() {
        assert_ne!(
            CapabilityClass::Document.queue_name(),
            CapabilityClass::Image.queue_name()
        );
        assert_eq!("text".parse::<CapabilityClass>(), Ok(CapabilityClass::Document));
    }
}
