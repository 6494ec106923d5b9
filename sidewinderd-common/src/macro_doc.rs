//! Macro document format
//!
//! A recorded macro is stored as a small XML document:
//!
//! ```xml
//! <Macro>
//!   <KeyBoardEvent Down="true">30</KeyBoardEvent>
//!   <DelayEvent>120</DelayEvent>
//!   <KeyBoardEvent Down="false">30</KeyBoardEvent>
//! </Macro>
//! ```
//!
//! Children are replayed in document order. Unknown children are skipped.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::{MacroEvent, MacroLog};

const ROOT_TAG: &str = "Macro";
const KEY_TAG: &str = "KeyBoardEvent";
const DELAY_TAG: &str = "DelayEvent";
const DOWN_ATTR: &[u8] = b"Down";

pub type MacroResult<T> = Result<T, MacroError>;

#[derive(Debug, Error)]
pub enum MacroError {
    #[error("macro file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed macro document: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("malformed macro attribute: {0}")]
    Attr(#[from] quick_xml::events::attributes::AttrError),

    #[error("missing <{ROOT_TAG}> root element")]
    MissingRoot,

    #[error("invalid value {value:?} in <{tag}>")]
    InvalidValue { tag: &'static str, value: String },
}

#[derive(Debug, Clone, Copy)]
enum Pending {
    Key { down: bool },
    Delay,
}

/// Parse a macro document
pub fn parse_macro(raw: &str) -> MacroResult<MacroLog> {
    let mut reader = Reader::from_str(raw);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut log = MacroLog::new();

    let mut in_root = false;
    let mut seen_root = false;
    let mut pending: Option<Pending> = None;
    let mut value: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(element) => {
                let name = element.name();
                match name.as_ref() {
                    b"Macro" if !seen_root => {
                        in_root = true;
                        seen_root = true;
                    }
                    b"KeyBoardEvent" if in_root => {
                        pending = Some(Pending::Key { down: parse_down(&element)? });
                        value = None;
                    }
                    b"DelayEvent" if in_root => {
                        pending = Some(Pending::Delay);
                        value = None;
                    }
                    _ => {}
                }
            }
            Event::Empty(element) => {
                if element.name().as_ref() == ROOT_TAG.as_bytes() && !seen_root {
                    seen_root = true;
                }
            }
            Event::Text(text) => {
                if pending.is_some() {
                    value = Some(text.unescape()?.trim().to_string());
                }
            }
            Event::End(end) => {
                let name = end.name();
                match name.as_ref() {
                    b"KeyBoardEvent" | b"DelayEvent" => {
                        if let (Some(entry), Some(text)) = (pending.take(), value.take()) {
                            log.push(finish_entry(entry, &text)?);
                        }
                    }
                    b"Macro" => in_root = false,
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !seen_root {
        return Err(MacroError::MissingRoot);
    }

    Ok(log)
}

fn parse_down(element: &BytesStart<'_>) -> MacroResult<bool> {
    for attr in element.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == DOWN_ATTR {
            let value = attr.unescape_value()?;
            return match value.trim() {
                "true" | "1" => Ok(true),
                "false" | "0" => Ok(false),
                other => Err(MacroError::InvalidValue { tag: KEY_TAG, value: other.to_string() }),
            };
        }
    }
    // no attribute means release
    Ok(false)
}

fn finish_entry(entry: Pending, text: &str) -> MacroResult<MacroEvent> {
    match entry {
        Pending::Key { down } => {
            let code = text.parse::<u16>().map_err(|_| MacroError::InvalidValue {
                tag: KEY_TAG,
                value: text.to_string(),
            })?;
            Ok(MacroEvent::Key { code, down })
        }
        Pending::Delay => {
            let ms = text.parse::<u32>().map_err(|_| MacroError::InvalidValue {
                tag: DELAY_TAG,
                value: text.to_string(),
            })?;
            Ok(MacroEvent::Delay(ms))
        }
    }
}

/// Render a macro log as a document
pub fn render_macro(log: &MacroLog) -> MacroResult<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new(ROOT_TAG)))?;

    for event in &log.events {
        match event {
            MacroEvent::Key { code, down } => {
                let mut start = BytesStart::new(KEY_TAG);
                start.push_attribute(("Down", if *down { "true" } else { "false" }));
                writer.write_event(Event::Start(start))?;
                writer.write_event(Event::Text(BytesText::new(&code.to_string())))?;
                writer.write_event(Event::End(BytesEnd::new(KEY_TAG)))?;
            }
            MacroEvent::Delay(ms) => {
                writer.write_event(Event::Start(BytesStart::new(DELAY_TAG)))?;
                writer.write_event(Event::Text(BytesText::new(&ms.to_string())))?;
                writer.write_event(Event::End(BytesEnd::new(DELAY_TAG)))?;
            }
        }
    }

    writer.write_event(Event::End(BytesEnd::new(ROOT_TAG)))?;

    let bytes = writer.into_inner();
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Load the macro stored at `path`
pub fn load_macro(path: &Path) -> MacroResult<MacroLog> {
    let content = fs::read_to_string(path)?;
    let log = parse_macro(&content)?;
    debug!("Loaded {} macro events from {}", log.len(), path.display());
    Ok(log)
}

/// Save `log` to `path`, replacing any previous macro in that slot
pub fn save_macro(path: &Path, log: &MacroLog) -> MacroResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let content = render_macro(log)?;
    fs::write(path, content)?;
    debug!("Saved {} macro events to {}", log.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_log() -> MacroLog {
        MacroLog {
            events: vec![
                MacroEvent::Key { code: 30, down: true },
                MacroEvent::Delay(120),
                MacroEvent::Key { code: 30, down: false },
                MacroEvent::Delay(5),
                MacroEvent::Key { code: 48, down: true },
                MacroEvent::Key { code: 48, down: false },
            ],
        }
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("profile_1").join("s01.xml");

        save_macro(&path, &sample_log()).unwrap();
        let loaded = load_macro(&path).unwrap();

        assert_eq!(loaded, sample_log());
    }

    #[test]
    fn test_parse_original_document() {
        let raw = r#"<?xml version="1.0" encoding="UTF-8"?>
<Macro>
    <KeyBoardEvent Down="true">42</KeyBoardEvent>
    <DelayEvent>87</DelayEvent>
    <KeyBoardEvent Down="false">42</KeyBoardEvent>
</Macro>"#;

        let log = parse_macro(raw).unwrap();
        assert_eq!(
            log.events,
            vec![
                MacroEvent::Key { code: 42, down: true },
                MacroEvent::Delay(87),
                MacroEvent::Key { code: 42, down: false },
            ]
        );
    }

    #[test]
    fn test_unknown_children_are_skipped() {
        let raw = "<Macro><MouseEvent>1</MouseEvent><KeyBoardEvent Down=\"1\">2</KeyBoardEvent></Macro>";
        let log = parse_macro(raw).unwrap();
        assert_eq!(log.events, vec![MacroEvent::Key { code: 2, down: true }]);
    }

    #[test]
    fn test_empty_root_is_empty_macro() {
        assert!(parse_macro("<Macro/>").unwrap().is_empty());
        assert!(parse_macro("<Macro></Macro>").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_documents_are_errors() {
        assert!(matches!(parse_macro("<Other/>"), Err(MacroError::MissingRoot)));
        assert!(parse_macro("<Macro><DelayEvent>soon</DelayEvent></Macro>").is_err());
        assert!(parse_macro("<Macro><KeyBoardEvent Down=\"maybe\">3</KeyBoardEvent></Macro>").is_err());
        assert!(parse_macro("<Macro><DelayEvent>5</KeyBoardEvent></Macro>").is_err());
    }

    #[test]
    fn test_overwrite_discards_previous_log() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("s02.xml");

        save_macro(&path, &sample_log()).unwrap();
        let replacement = MacroLog { events: vec![MacroEvent::Key { code: 1, down: true }] };
        save_macro(&path, &replacement).unwrap();

        assert_eq!(load_macro(&path).unwrap(), replacement);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let temp_dir = TempDir::new().unwrap();
        let result = load_macro(&temp_dir.path().join("absent.xml"));
        assert!(matches!(result, Err(MacroError::Io(_))));
    }
}
