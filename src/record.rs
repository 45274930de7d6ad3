//! Record accessor for MMD metadata documents.
//!
//! A record is kept as an owned element tree so that a read → modify →
//! write cycle preserves names, prefixes, attributes, comments, and the
//! whitespace layout of the original file. Only the handful of elements the
//! reconciliation engine cares about are ever addressed, by a `/`-separated
//! key of local names (see [`mmd`]).
//!
//! Key lookup mirrors the `.//a/b` idiom: the first segment matches any
//! descendant of the root in document order, the remaining segments are
//! direct children.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

/// Keys of the MMD elements read or written by this crate.
pub mod mmd {
    pub const METADATA_STATUS: &str = "metadata_status";
    pub const METADATA_IDENTIFIER: &str = "metadata_identifier";
    pub const TITLE: &str = "title";
    pub const PRODUCTION_STATUS: &str = "dataset_production_status";
    pub const RELATED_DATASET: &str = "related_dataset";
    pub const RELATION_TYPE: &str = "relation_type";
    pub const PLATFORM: &str = "platform";
    pub const PLATFORM_INSTRUMENT: &str = "platform/instrument";
    pub const INSTRUMENT: &str = "instrument";
    pub const PRODUCT_TYPE: &str = "product_type";
    pub const MODE: &str = "mode";
    pub const ORBIT_ABSOLUTE: &str = "orbit_absolute";
    pub const START_DATE: &str = "temporal_extent/start_date";
    pub const END_DATE: &str = "temporal_extent/end_date";
    pub const NORTH: &str = "geographic_extent/rectangle/north";
    pub const SOUTH: &str = "geographic_extent/rectangle/south";
    pub const EAST: &str = "geographic_extent/rectangle/east";
    pub const WEST: &str = "geographic_extent/rectangle/west";
    pub const UPDATE_DATETIME: &str = "last_metadata_update/update/datetime";
    pub const UPDATE_TYPE: &str = "last_metadata_update/update/type";
    pub const CITATION_PUBLICATION_DATE: &str = "dataset_citation/publication_date";
    pub const CITATION_TITLE: &str = "dataset_citation/title";
    pub const CITATION_URL: &str = "dataset_citation/url";
    pub const RELATED_RESOURCE: &str = "related_information/resource";
    pub const STORAGE_INFORMATION: &str = "storage_information";
    pub const DATA_ACCESS: &str = "data_access";
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed XML in {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },
    #[error("XML error: {0}")]
    Xml(String),
}

impl RecordError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RecordError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }

    fn io(path: &Path) -> impl FnOnce(io::Error) -> RecordError + '_ {
        move |source| RecordError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn xml_err(e: impl std::fmt::Display) -> RecordError {
    RecordError::Xml(e.to_string())
}

/// Outcome of writing a single field.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldUpdate {
    Updated,
    NotFound,
}

impl FieldUpdate {
    pub fn is_updated(self) -> bool {
        self == FieldUpdate::Updated
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
    CData(String),
    Comment(String),
}

impl Node {
    fn is_whitespace(&self) -> bool {
        matches!(self, Node::Text(t) if t.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    /// Qualified name as written in the document (`mmd:title`).
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> Result<Self, RecordError> {
        let name = String::from_utf8(start.name().as_ref().to_vec()).map_err(xml_err)?;
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(xml_err)?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value().map_err(xml_err)?.into_owned();
            attributes.push((key, value));
        }
        Ok(Element {
            name,
            attributes,
            children: Vec::new(),
        })
    }

    pub fn local_name(&self) -> &str {
        self.name.rsplit(':').next().unwrap_or(&self.name)
    }

    pub fn prefix(&self) -> Option<&str> {
        self.name.split_once(':').map(|(p, _)| p)
    }

    /// Concatenated character data, trimmed.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            match node {
                Node::Text(t) | Node::CData(t) => out.push_str(t),
                _ => {}
            }
        }
        out.trim().to_string()
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name || k.rsplit(':').next() == Some(name))
            .map(|(_, v)| v.as_str())
    }

    fn child_elements(&self) -> impl Iterator<Item = (usize, &Element)> {
        self.children.iter().enumerate().filter_map(|(i, n)| match n {
            Node::Element(e) => Some((i, e)),
            _ => None,
        })
    }

    fn remove_named(&mut self, local: &str) -> usize {
        let mut removed = 0;
        let mut kept: Vec<Node> = Vec::with_capacity(self.children.len());
        for node in self.children.drain(..) {
            match node {
                Node::Element(e) if e.local_name() == local => {
                    removed += 1;
                    if kept.last().is_some_and(Node::is_whitespace) {
                        kept.pop();
                    }
                }
                Node::Element(mut e) => {
                    removed += e.remove_named(local);
                    kept.push(Node::Element(e));
                }
                other => kept.push(other),
            }
        }
        self.children = kept;
        removed
    }
}

/// A parsed metadata document.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    declaration: bool,
    root: Element,
}

impl Record {
    pub fn read(path: &Path) -> Result<Self, RecordError> {
        let bytes = fs::read(path).map_err(RecordError::io(path))?;
        Self::parse(&bytes).map_err(|e| match e {
            RecordError::Xml(reason) => RecordError::Malformed {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, RecordError> {
        let mut reader = Reader::from_reader(bytes);
        let mut buf = Vec::new();
        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;
        let mut declaration = false;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Decl(_)) => declaration = true,
                Ok(Event::Start(e)) => stack.push(Element::from_start(&e)?),
                Ok(Event::Empty(e)) => {
                    let element = Element::from_start(&e)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Ok(Event::End(_)) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| RecordError::Xml("unbalanced end tag".into()))?;
                    attach(&mut stack, &mut root, element)?;
                }
                Ok(Event::Text(e)) => {
                    if let Some(top) = stack.last_mut() {
                        let text = e.unescape().map_err(xml_err)?;
                        top.children.push(Node::Text(text.into_owned()));
                    }
                }
                Ok(Event::CData(e)) => {
                    if let Some(top) = stack.last_mut() {
                        top.children
                            .push(Node::CData(String::from_utf8_lossy(&e).into_owned()));
                    }
                }
                Ok(Event::Comment(e)) => {
                    if let Some(top) = stack.last_mut() {
                        top.children
                            .push(Node::Comment(String::from_utf8_lossy(&e).into_owned()));
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(xml_err(e)),
            }
            buf.clear();
        }

        if !stack.is_empty() {
            return Err(RecordError::Xml("unexpected end of document".into()));
        }
        let root = root.ok_or_else(|| RecordError::Xml("document has no root element".into()))?;
        Ok(Record { declaration, root })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RecordError> {
        let mut writer = Writer::new(Vec::new());
        if self.declaration {
            writer
                .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
                .map_err(xml_err)?;
            writer.get_mut().push(b'\n');
        }
        write_element(&mut writer, &self.root)?;
        let mut bytes = writer.into_inner();
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Replace the file at `path` in one step.
    ///
    /// The document is written to a temporary file in the same directory and
    /// renamed over the target, so readers see either the old or the new
    /// record, never a partial one.
    pub fn write(&self, path: &Path) -> Result<(), RecordError> {
        let bytes = self.to_bytes()?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(RecordError::io(path))?;
        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(RecordError::io(path))?;
        temp.write_all(&bytes).map_err(RecordError::io(path))?;
        temp.as_file().sync_all().map_err(RecordError::io(path))?;
        temp.persist(path).map_err(|e| RecordError::Io {
            path: path.to_path_buf(),
            source: e.error,
        })?;
        Ok(())
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    pub fn element(&self, key: &str) -> Option<&Element> {
        let path = self.locate(key)?;
        self.element_at(&path)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.locate(key).is_some()
    }

    pub fn text(&self, key: &str) -> Option<String> {
        self.element(key).map(Element::text)
    }

    /// Replace the content of the first element matching `key`.
    pub fn set_text(&mut self, key: &str, value: &str) -> FieldUpdate {
        let Some(path) = self.locate(key) else {
            return FieldUpdate::NotFound;
        };
        match self.element_at_mut(&path) {
            Some(element) => {
                element.children = vec![Node::Text(value.to_string())];
                FieldUpdate::Updated
            }
            None => FieldUpdate::NotFound,
        }
    }

    /// Like [`Record::set_text`], but creates the missing tail of `key`.
    ///
    /// The deepest existing prefix of the key is extended with new elements;
    /// if no prefix exists the whole chain is appended to the root.
    pub fn ensure_text(&mut self, key: &str, value: &str) {
        if self.set_text(key, value).is_updated() {
            return;
        }
        let segments: Vec<&str> = key.split('/').filter(|s| !s.is_empty()).collect();
        let (anchor, missing) = (1..segments.len())
            .rev()
            .find_map(|i| {
                self.locate(&segments[..i].join("/"))
                    .map(|path| (path, &segments[i..]))
            })
            .unwrap_or((Vec::new(), &segments[..]));

        let mut node = Node::Text(value.to_string());
        for local in missing.iter().rev() {
            node = Node::Element(Element {
                name: self.qualified(local),
                attributes: Vec::new(),
                children: vec![node],
            });
        }
        if let Some(container) = self.element_at_mut(&anchor) {
            container.children.push(node);
        }
    }

    /// Remove every element with this local name, wherever it appears.
    pub fn remove_all(&mut self, local_name: &str) -> usize {
        self.root.remove_named(local_name)
    }

    /// Qualify a local name with the root element's namespace prefix.
    pub fn qualified(&self, local_name: &str) -> String {
        match self.root.prefix() {
            Some(prefix) => format!("{}:{}", prefix, local_name),
            None => local_name.to_string(),
        }
    }

    /// Insert a new text element as the first child of the element at `container`.
    pub fn insert_first(&mut self, container: &str, local_name: &str, text: &str) -> FieldUpdate {
        let name = self.qualified(local_name);
        let Some(path) = self.locate(container) else {
            return FieldUpdate::NotFound;
        };
        let Some(parent) = self.element_at_mut(&path) else {
            return FieldUpdate::NotFound;
        };
        let element = Node::Element(Element {
            name,
            attributes: Vec::new(),
            children: vec![Node::Text(text.to_string())],
        });
        match parent.children.first() {
            Some(Node::Text(indent)) if indent.trim().is_empty() => {
                let indent = indent.clone();
                parent.children.insert(1, element);
                parent.children.insert(2, Node::Text(indent));
            }
            _ => parent.children.insert(0, element),
        }
        FieldUpdate::Updated
    }

    /// Append a new text element as the last child of the root.
    pub fn append_to_root(&mut self, local_name: &str, attributes: &[(&str, &str)], text: &str) {
        let element = Node::Element(Element {
            name: self.qualified(local_name),
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            children: vec![Node::Text(text.to_string())],
        });
        let children = &mut self.root.children;
        let indent = children
            .iter()
            .rev()
            .skip_while(|n| n.is_whitespace())
            .skip(1)
            .find_map(|n| match n {
                Node::Text(t) if t.trim().is_empty() => Some(t.clone()),
                _ => None,
            })
            .unwrap_or_else(|| "\n  ".to_string());
        if children.last().is_some_and(Node::is_whitespace) {
            let at = children.len() - 1;
            children.insert(at, element);
            children.insert(at, Node::Text(indent));
        } else {
            children.push(Node::Text(indent));
            children.push(element);
            children.push(Node::Text("\n".to_string()));
        }
    }

    fn locate(&self, key: &str) -> Option<Vec<usize>> {
        let segments: Vec<&str> = key.split('/').filter(|s| !s.is_empty()).collect();
        let (first, rest) = segments.split_first()?;
        let mut path = Vec::new();
        find_descendant(&self.root, first, rest, &mut path).then_some(path)
    }

    fn element_at(&self, path: &[usize]) -> Option<&Element> {
        let mut element = &self.root;
        for &i in path {
            element = match element.children.get(i)? {
                Node::Element(child) => child,
                _ => return None,
            };
        }
        Some(element)
    }

    fn element_at_mut(&mut self, path: &[usize]) -> Option<&mut Element> {
        let mut element = &mut self.root;
        for &i in path {
            element = match element.children.get_mut(i)? {
                Node::Element(child) => child,
                _ => return None,
            };
        }
        Some(element)
    }
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), RecordError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Element(element)),
        None if root.is_none() => *root = Some(element),
        None => return Err(RecordError::Xml("multiple root elements".into())),
    }
    Ok(())
}

fn find_descendant(element: &Element, first: &str, rest: &[&str], path: &mut Vec<usize>) -> bool {
    for (i, child) in element.child_elements() {
        path.push(i);
        if child.local_name() == first {
            let mark = path.len();
            if resolve_children(child, rest, path) {
                return true;
            }
            path.truncate(mark);
        }
        if find_descendant(child, first, rest, path) {
            return true;
        }
        path.pop();
    }
    false
}

fn resolve_children(element: &Element, rest: &[&str], path: &mut Vec<usize>) -> bool {
    let Some((segment, tail)) = rest.split_first() else {
        return true;
    };
    for (i, child) in element.child_elements() {
        if child.local_name() == *segment {
            path.push(i);
            if resolve_children(child, tail, path) {
                return true;
            }
            path.pop();
        }
    }
    false
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &Element) -> Result<(), RecordError> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }
    if element.children.is_empty() {
        writer.write_event(Event::Empty(start)).map_err(xml_err)?;
        return Ok(());
    }
    writer.write_event(Event::Start(start)).map_err(xml_err)?;
    for node in &element.children {
        match node {
            Node::Element(child) => write_element(writer, child)?,
            Node::Text(text) => writer
                .write_event(Event::Text(BytesText::new(text)))
                .map_err(xml_err)?,
            Node::CData(text) => writer
                .write_event(Event::CData(BytesCData::new(text.as_str())))
                .map_err(xml_err)?,
            Node::Comment(text) => writer
                .write_event(Event::Comment(BytesText::from_escaped(text.as_str())))
                .map_err(xml_err)?,
        }
    }
    writer
        .write_event(Event::End(BytesEnd::new(element.name.as_str())))
        .map_err(xml_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<mmd:mmd xmlns:mmd="http://www.met.no/schema/mmd">
  <mmd:title xml:lang="en">Child &amp; co</mmd:title>
  <!-- kept -->
  <mmd:platform>
    <mmd:short_name>Sentinel-1A</mmd:short_name>
    <mmd:instrument>
      <mmd:short_name>SAR-C</mmd:short_name>
    </mmd:instrument>
  </mmd:platform>
  <mmd:dataset_citation>
    <mmd:title>Citation</mmd:title>
  </mmd:dataset_citation>
  <mmd:data_access><mmd:type>HTTP</mmd:type></mmd:data_access>
  <mmd:data_access><mmd:type>OPeNDAP</mmd:type></mmd:data_access>
</mmd:mmd>
"#;

    fn doc() -> Record {
        Record::parse(DOC.as_bytes()).unwrap()
    }

    #[test]
    fn reads_text_and_attributes() {
        let r = doc();
        assert_eq!(r.text("title").as_deref(), Some("Child & co"));
        assert_eq!(r.element("title").unwrap().attribute("lang"), Some("en"));
        assert_eq!(r.text("dataset_citation/title").as_deref(), Some("Citation"));
        assert_eq!(
            r.text("platform/instrument/short_name").as_deref(),
            Some("SAR-C")
        );
    }

    #[test]
    fn first_segment_matches_any_depth() {
        let r = doc();
        assert!(r.contains("instrument/short_name"));
        assert!(!r.contains("platform/short_name/instrument"));
        assert!(!r.contains("product_type"));
    }

    #[test]
    fn round_trip_is_lossless() {
        let r = doc();
        let bytes = r.to_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("<!-- kept -->"));
        assert!(text.contains("Child &amp; co"));
        assert_eq!(Record::parse(text.as_bytes()).unwrap(), r);
    }

    #[test]
    fn set_text_reports_missing_fields() {
        let mut r = doc();
        assert_eq!(r.set_text("dataset_citation/title", "New"), FieldUpdate::Updated);
        assert_eq!(r.text("dataset_citation/title").as_deref(), Some("New"));
        assert_eq!(r.set_text("dataset_citation/url", "x"), FieldUpdate::NotFound);
    }

    #[test]
    fn remove_all_drops_every_match() {
        let mut r = doc();
        assert_eq!(r.remove_all("data_access"), 2);
        assert!(!r.contains("data_access"));
        assert_eq!(r.remove_all("data_access"), 0);
    }

    #[test]
    fn inserts_use_root_prefix() {
        let mut r = doc();
        assert!(r
            .insert_first("platform/instrument", "mode", "EW")
            .is_updated());
        r.append_to_root("related_dataset", &[("relation_type", "parent")], "no.met:1");
        let reparsed = Record::parse(&r.to_bytes().unwrap()).unwrap();
        assert_eq!(reparsed.text("platform/instrument/mode").as_deref(), Some("EW"));
        let related = reparsed.element("related_dataset").unwrap();
        assert_eq!(related.name, "mmd:related_dataset");
        assert_eq!(related.attribute("relation_type"), Some("parent"));
        assert_eq!(
            r.insert_first("nowhere", "mode", "EW"),
            FieldUpdate::NotFound
        );
    }

    #[test]
    fn rejects_broken_documents() {
        assert!(Record::parse(b"<a><b></a>").is_err());
        assert!(Record::parse(b"").is_err());
        assert!(Record::parse(b"<a>").is_err());
    }

    #[test]
    fn atomic_write_replaces_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("r.xml");
        let mut r = doc();
        r.write(&path).unwrap();
        let _ = r.set_text("title", "Second");
        r.write(&path).unwrap();
        assert_eq!(
            Record::read(&path).unwrap().text("title").as_deref(),
            Some("Second")
        );
        let err = Record::read(&tmp.path().join("missing.xml")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn ensure_text_builds_missing_elements() {
        let mut r = doc();
        r.ensure_text("geographic_extent/rectangle/north", "80.0");
        assert_eq!(
            r.text("geographic_extent/rectangle/north").as_deref(),
            Some("80.0")
        );
        r.ensure_text("geographic_extent/rectangle/south", "70.0");
        let extents = r
            .root()
            .children
            .iter()
            .filter(|n| matches!(n, Node::Element(e) if e.local_name() == "geographic_extent"))
            .count();
        assert_eq!(extents, 1);
        r.ensure_text("geographic_extent/rectangle/north", "81.0");
        assert_eq!(
            r.text("geographic_extent/rectangle/north").as_deref(),
            Some("81.0")
        );
        assert_eq!(
            r.element("geographic_extent").unwrap().name,
            "mmd:geographic_extent"
        );
    }
}
