//! Streaming XML record source.
//!
//! Pull-mode tokenization over `quick-xml`: the source yields one [`Record`]
//! per depth-2 child of the document root, as a finite, non-restartable
//! iterator. At most one record plus a bounded scratch buffer is held in
//! memory, so documents larger than memory stream through.
//!
//! The reader moves through `BeforeRoot -> InRoot -> InRecord -> InRoot ->
//! ... -> Done`; transitions are driven by start/end element events, end of
//! document, or the optional byte window. The window is a hint: reaching the
//! end offset terminates the stream at the next record boundary, with the
//! in-flight record still emitted.

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::debug;

use xsink_core::{Record, Value, XsinkError, ATTR_PREFIX, TEXT_KEY};

/// Lazy sequence of `(element name, value tree)` pairs extracted from one
/// XML document.
pub struct XmlRecordSource {
    reader: Reader<BufReader<File>>,
    buf: Vec<u8>,
    in_root: bool,
    done: bool,
    /// Raw file offset the reader started at; `buffer_position` is relative
    /// to it.
    base_offset: u64,
    end_byte: Option<u64>,
}

impl std::fmt::Debug for XmlRecordSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmlRecordSource")
            .field("in_root", &self.in_root)
            .field("done", &self.done)
            .field("base_offset", &self.base_offset)
            .field("end_byte", &self.end_byte)
            .finish()
    }
}

/// One decoded tokenizer event with all borrowed data copied out, so the
/// tree builder can recurse without holding the scratch buffer.
enum Step {
    Start { name: String, attrs: Vec<(String, String)> },
    Empty { name: String, attrs: Vec<(String, String)> },
    End,
    Text(String),
    Eof,
    Skip,
}

impl XmlRecordSource {
    /// Opens `path` and positions the stream at the optional byte window.
    /// A non-zero start offset must be record-aligned; no index pass is
    /// performed.
    pub fn open(path: &Path, window: Option<(u64, u64)>) -> Result<XmlRecordSource, XsinkError> {
        let mut file = File::open(path)
            .map_err(|e| XsinkError::Input(format!("cannot open {}: {e}", path.display())))?;
        let base_offset = match window {
            Some((start, _)) if start > 0 => {
                file.seek(SeekFrom::Start(start))
                    .map_err(|e| XsinkError::Input(format!("cannot seek {}: {e}", path.display())))?;
                start
            }
            _ => 0,
        };
        let mut reader = Reader::from_reader(BufReader::new(file));
        reader.trim_text(true);
        Ok(XmlRecordSource {
            reader,
            buf: Vec::new(),
            in_root: false,
            done: false,
            base_offset,
            end_byte: window.map(|(_, end)| end),
        })
    }

    /// Probes the document for its root element's local name. Opens the file
    /// independently of any record stream.
    pub fn root_element_name(path: &Path) -> Result<Option<String>, XsinkError> {
        let mut src = XmlRecordSource::open(path, None)?;
        loop {
            match src.next_step()? {
                Step::Start { name, .. } | Step::Empty { name, .. } => return Ok(Some(name)),
                Step::Eof => return Ok(None),
                _ => {}
            }
        }
    }

    /// Probes the root element for the first schema-location-like attribute
    /// and extracts the URL from it. The attribute value is either a
    /// whitespace-separated `(namespace, url)` pair or a bare URL.
    pub fn schema_location_hint(path: &Path) -> Result<Option<String>, XsinkError> {
        let mut src = XmlRecordSource::open(path, None)?;
        loop {
            match src.next_step()? {
                Step::Start { attrs, .. } | Step::Empty { attrs, .. } => {
                    let hit = attrs
                        .iter()
                        .find(|(k, _)| {
                            k == "schemaLocation" || k == "noNamespaceSchemaLocation"
                        })
                        .and_then(|(_, v)| pick_schema_url(v));
                    return Ok(hit);
                }
                Step::Eof => return Ok(None),
                _ => {}
            }
        }
    }

    fn window_closed(&self) -> bool {
        match self.end_byte {
            Some(end) => self.base_offset + self.reader.buffer_position() as u64 >= end,
            None => false,
        }
    }

    fn next_step(&mut self) -> Result<Step, XsinkError> {
        self.buf.clear();
        match self.reader.read_event_into(&mut self.buf) {
            Ok(Event::Start(e)) => Ok(Step::Start {
                name: local_name(&e),
                attrs: collect_attrs(&e)?,
            }),
            Ok(Event::Empty(e)) => Ok(Step::Empty {
                name: local_name(&e),
                attrs: collect_attrs(&e)?,
            }),
            Ok(Event::End(_)) => Ok(Step::End),
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| XsinkError::Input(format!("bad character data: {e}")))?;
                Ok(Step::Text(text.into_owned()))
            }
            // CDATA is treated identically to character data.
            Ok(Event::CData(t)) => {
                Ok(Step::Text(String::from_utf8_lossy(&t.into_inner()).into_owned()))
            }
            Ok(Event::Eof) => Ok(Step::Eof),
            Ok(_) => Ok(Step::Skip),
            Err(e) => Err(XsinkError::Input(format!(
                "malformed XML near byte {}: {e}",
                self.base_offset + self.reader.buffer_position() as u64
            ))),
        }
    }

    /// Consumes events until the element whose attributes are given closes,
    /// building its value tree. Child element values are always lists, text
    /// is trimmed and accumulated, and text inside an element that also has
    /// child elements is discarded in favor of the children.
    fn read_element(&mut self, attrs: Vec<(String, String)>) -> Result<Value, XsinkError> {
        let mut node = attrs_record(attrs);
        let mut text = String::new();
        let mut has_children = false;
        loop {
            match self.next_step()? {
                Step::Start { name, attrs } => {
                    let child = self.read_element(attrs)?;
                    node.push_child(&name, child);
                    has_children = true;
                }
                Step::Empty { name, attrs } => {
                    node.push_child(&name, attrs_record(attrs));
                    has_children = true;
                }
                Step::Text(t) => text.push_str(&t),
                Step::End => break,
                Step::Eof => {
                    return Err(XsinkError::Input(
                        "unexpected end of document inside a record".into(),
                    ))
                }
                Step::Skip => {}
            }
        }
        let trimmed = text.trim();
        if !trimmed.is_empty() && !has_children {
            node.insert_entry(TEXT_KEY.to_string(), Value::Text(trimmed.to_string()));
        }
        Ok(node)
    }
}

impl Iterator for XmlRecordSource {
    type Item = Result<Record, XsinkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.window_closed() {
            debug!("byte window reached, ending record stream");
            self.done = true;
            return None;
        }
        loop {
            match self.next_step() {
                Err(e) => {
                    // A parse failure terminates the sequence; the partially
                    // built record is discarded.
                    self.done = true;
                    return Some(Err(e));
                }
                Ok(Step::Start { name, attrs }) => {
                    if !self.in_root {
                        self.in_root = true;
                        continue;
                    }
                    return match self.read_element(attrs) {
                        Ok(tree) => Some(Ok(Record::new(name, tree))),
                        Err(e) => {
                            self.done = true;
                            Some(Err(e))
                        }
                    };
                }
                Ok(Step::Empty { name, attrs }) => {
                    if self.in_root {
                        return Some(Ok(Record::new(name, attrs_record(attrs))));
                    }
                    // An empty root element: no records.
                    self.done = true;
                    return None;
                }
                Ok(Step::End) => {
                    // The root closed.
                    self.done = true;
                    return None;
                }
                Ok(Step::Eof) => {
                    self.done = true;
                    return None;
                }
                Ok(Step::Text(_)) | Ok(Step::Skip) => {}
            }
        }
    }
}

/// Namespace prefixes are flattened to local names throughout.
fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn collect_attrs(e: &BytesStart<'_>) -> Result<Vec<(String, String)>, XsinkError> {
    let mut out = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| XsinkError::Input(format!("bad attribute: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| XsinkError::Input(format!("bad attribute value: {e}")))?
            .into_owned();
        out.push((key, value));
    }
    Ok(out)
}

fn attrs_record(attrs: Vec<(String, String)>) -> Value {
    let mut node = Value::empty_record();
    for (k, v) in attrs {
        node.insert_entry(format!("{ATTR_PREFIX}{k}"), Value::Text(v));
    }
    node
}

fn pick_schema_url(raw: &str) -> Option<String> {
    let tokens: Vec<&str> = raw.split_whitespace().collect();
    match tokens.as_slice() {
        [] => None,
        [only] => Some((*only).to_string()),
        [_, rest @ ..] => rest
            .iter()
            .find(|t| t.starts_with("http"))
            .map(|t| (*t).to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn write_doc(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn leaf(text: &str) -> Value {
        Value::Record(vec![(TEXT_KEY.to_string(), Value::Text(text.into()))])
    }

    #[test]
    fn emits_one_record_per_depth_two_child_in_order() {
        let doc = write_doc(
            r#"<catalog>
                 <book><title>Dune</title><year>1965</year></book>
                 <book><title>Neuromancer</title><year>1984</year></book>
               </catalog>"#,
        );
        let records: Vec<Record> = XmlRecordSource::open(doc.path(), None)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "book");
        assert_eq!(
            records[0].tree.get("title"),
            Some(&Value::List(vec![leaf("Dune")]))
        );
        assert_eq!(
            records[1].tree.get("year"),
            Some(&Value::List(vec![leaf("1984")]))
        );
    }

    #[test]
    fn single_occurrence_children_are_lists() {
        let doc = write_doc("<data><record><tags><tag>a</tag></tags></record></data>");
        let records: Vec<Record> = XmlRecordSource::open(doc.path(), None)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let Some(Value::List(tags)) = records[0].tree.get("tags") else {
            panic!("tags must be a list");
        };
        assert_eq!(tags.len(), 1);
        let Some(Value::List(tag)) = tags[0].get("tag") else {
            panic!("tag must be a list");
        };
        assert_eq!(tag, &vec![leaf("a")]);
    }

    #[test]
    fn attributes_text_and_cdata() {
        let doc = write_doc(
            r#"<root><item id="7"><![CDATA[ hello <world> ]]></item></root>"#,
        );
        let records: Vec<Record> = XmlRecordSource::open(doc.path(), None)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records[0].tree.get("@id"), Some(&Value::Text("7".into())));
        assert_eq!(records[0].tree.text_content(), Some("hello <world>"));
    }

    #[test]
    fn mixed_content_drops_text_in_favor_of_children() {
        let doc = write_doc("<root><item>noise<child>x</child>more noise</item></root>");
        let records: Vec<Record> = XmlRecordSource::open(doc.path(), None)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records[0].tree.get(TEXT_KEY), None);
        assert!(records[0].tree.get("child").is_some());
    }

    #[test]
    fn namespaces_flatten_to_local_names() {
        let doc = write_doc(
            r#"<ns:root xmlns:ns="urn:x"><ns:item><ns:name>a</ns:name></ns:item></ns:root>"#,
        );
        let records: Vec<Record> = XmlRecordSource::open(doc.path(), None)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records[0].name, "item");
        assert!(records[0].tree.get("name").is_some());
    }

    #[test]
    fn empty_document_yields_no_records() {
        let doc = write_doc("<root></root>");
        let records: Vec<Record> = XmlRecordSource::open(doc.path(), None)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(records.is_empty());

        let doc = write_doc("<root/>");
        let records: Vec<Record> = XmlRecordSource::open(doc.path(), None)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn malformed_xml_surfaces_an_input_error() {
        let doc = write_doc("<root><item><broken></item></root>");
        let result: Result<Vec<Record>, _> =
            XmlRecordSource::open(doc.path(), None).unwrap().collect();
        assert!(matches!(result, Err(XsinkError::Input(_))));
    }

    #[test]
    fn missing_file_is_an_input_error() {
        let err = XmlRecordSource::open(Path::new("/nonexistent/x.xml"), None).unwrap_err();
        assert!(matches!(err, XsinkError::Input(_)));
    }

    #[test]
    fn byte_window_ends_the_stream_at_a_record_boundary() {
        let doc = write_doc("<root><a>1</a><b>2</b><c>3</c></root>");
        // A window ending inside the document: fewer records, no error, and
        // whatever was emitted is whole.
        let records: Vec<Record> = XmlRecordSource::open(doc.path(), Some((0, 14)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(records.len() < 3);
        for r in &records {
            assert!(r.tree.text_content().is_some());
        }
    }

    #[test]
    fn root_probe_and_schema_location_probe() {
        let doc = write_doc(
            r#"<catalog xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"
                        xsi:schemaLocation="urn:books http://example.com/books.xsd">
                 <book/>
               </catalog>"#,
        );
        assert_eq!(
            XmlRecordSource::root_element_name(doc.path()).unwrap(),
            Some("catalog".to_string())
        );
        assert_eq!(
            XmlRecordSource::schema_location_hint(doc.path()).unwrap(),
            Some("http://example.com/books.xsd".to_string())
        );

        let bare = write_doc(
            r#"<catalog xsi:noNamespaceSchemaLocation="http://example.com/b.xsd"
                        xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"/>"#,
        );
        assert_eq!(
            XmlRecordSource::schema_location_hint(bare.path()).unwrap(),
            Some("http://example.com/b.xsd".to_string())
        );

        let none = write_doc("<catalog><book/></catalog>");
        assert_eq!(XmlRecordSource::schema_location_hint(none.path()).unwrap(), None);
    }

    #[test]
    fn pick_schema_url_token_rules() {
        assert_eq!(
            pick_schema_url("urn:x http://e.com/a.xsd"),
            Some("http://e.com/a.xsd".to_string())
        );
        assert_eq!(
            pick_schema_url("https://e.com/a.xsd"),
            Some("https://e.com/a.xsd".to_string())
        );
        assert_eq!(pick_schema_url("urn:x urn:y"), None);
        assert_eq!(pick_schema_url("   "), None);
    }
}
