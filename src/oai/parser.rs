//! OAI-PMH response parsing.
//!
//! Responses are small (one page of records), so each body is first folded into
//! a namespace-aware element tree and then read the way the protocol lays it out:
//! `OAI-PMH > ListRecords > record > header / metadata > oai_dc:dc > dc:*`.

use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::NsReader;

pub const OAI_NS: &str = "http://www.openarchives.org/OAI/2.0/";
pub const OAI_DC_NS: &str = "http://www.openarchives.org/OAI/2.0/oai_dc/";
pub const DC_NS: &str = "http://purl.org/dc/elements/1.1/";
pub const DCTERMS_NS: &str = "http://purl.org/dc/terms/";

/// OAI error code that means "empty result", not a failure.
const NO_RECORDS_MATCH: &str = "noRecordsMatch";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("response was not valid XML: {0}")]
    Xml(String),
    #[error("{code}: {message}")]
    Oai { code: String, message: String },
    #[error("{0}")]
    Unexpected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldNamespace {
    Elements,
    Terms,
    Other(String),
}

/// One child of the `oai_dc:dc` container, exactly as the source sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawField {
    pub namespace: FieldNamespace,
    pub name: String,
    pub value: String,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord {
    pub identifier: Option<String>,
    pub datestamp: Option<String>,
    pub deleted: bool,
    pub set_specs: Vec<String>,
    /// `None` when the record carried no Dublin Core metadata block.
    pub fields: Option<Vec<RawField>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordPage {
    pub records: Vec<RawRecord>,
    pub resumption_token: Option<String>,
    pub complete_list_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyInfo {
    pub repository_name: Option<String>,
    pub base_url: Option<String>,
    pub earliest_datestamp: Option<String>,
}

#[derive(Debug, Default)]
struct XmlNode {
    namespace: Option<String>,
    name: String,
    attributes: Vec<(String, String)>,
    text: String,
    children: Vec<XmlNode>,
}

impl XmlNode {
    fn is(&self, namespace: &str, name: &str) -> bool {
        self.name == name && self.namespace.as_deref() == Some(namespace)
    }

    fn child(&self, namespace: &str, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.is(namespace, name))
    }

    fn children_named<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children.iter().filter(move |c| c.is(namespace, name))
    }

    fn descendant(&self, namespace: &str, name: &str) -> Option<&XmlNode> {
        for child in &self.children {
            if child.is(namespace, name) {
                return Some(child);
            }
            if let Some(found) = child.descendant(namespace, name) {
                return Some(found);
            }
        }
        None
    }

    fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn trimmed_text(&self) -> Option<String> {
        let t = self.text.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    }

    fn child_text(&self, namespace: &str, name: &str) -> Option<String> {
        self.child(namespace, name).and_then(|c| c.trimmed_text())
    }
}

fn open_node(resolved: ResolveResult, start: &BytesStart) -> Result<XmlNode, ParseError> {
    let namespace = match resolved {
        ResolveResult::Bound(ns) => Some(String::from_utf8_lossy(ns.0).into_owned()),
        _ => None,
    };
    let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| ParseError::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| ParseError::Xml(e.to_string()))?
            .into_owned();
        attributes.push((key, value));
    }
    Ok(XmlNode {
        namespace,
        name,
        attributes,
        ..Default::default()
    })
}

fn parse_tree(xml: &str) -> Result<XmlNode, ParseError> {
    let mut reader = NsReader::from_str(xml);
    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        let (resolved, event) = reader
            .read_resolved_event()
            .map_err(|e| ParseError::Xml(e.to_string()))?;
        match event {
            Event::Start(start) => {
                let node = open_node(resolved, &start)?;
                stack.push(node);
            }
            Event::Empty(start) => {
                let node = open_node(resolved, &start)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => root = Some(node),
                }
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| ParseError::Xml("unbalanced closing tag".to_string()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => root = Some(node),
                }
            }
            Event::Text(text) => {
                if let Some(node) = stack.last_mut() {
                    let value = text.unescape().map_err(|e| ParseError::Xml(e.to_string()))?;
                    node.text.push_str(&value);
                }
            }
            Event::CData(data) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(ParseError::Xml("unexpected end of document".to_string()));
    }
    root.ok_or_else(|| ParseError::Xml("empty document".to_string()))
}

fn parse_envelope(xml: &str) -> Result<XmlNode, ParseError> {
    let root = parse_tree(xml)?;
    if !root.is(OAI_NS, "OAI-PMH") {
        return Err(ParseError::Unexpected(format!(
            "expected an OAI-PMH document, found <{}>",
            root.name
        )));
    }
    Ok(root)
}

fn oai_error(root: &XmlNode) -> Option<ParseError> {
    let node = root.descendant(OAI_NS, "error")?;
    let code = node.attr("code").unwrap_or_default().to_string();
    let message = node
        .trimmed_text()
        .unwrap_or_else(|| "The OAI endpoint returned an error.".to_string());
    Some(ParseError::Oai { code, message })
}

fn parse_record(node: &XmlNode) -> RawRecord {
    let mut record = RawRecord::default();

    if let Some(header) = node.child(OAI_NS, "header") {
        record.deleted = header.attr("status") == Some("deleted");
        record.identifier = header.child_text(OAI_NS, "identifier");
        record.datestamp = header.child_text(OAI_NS, "datestamp");
        record.set_specs = header
            .children_named(OAI_NS, "setSpec")
            .filter_map(|s| s.trimmed_text())
            .collect();
    }

    record.fields = node
        .child(OAI_NS, "metadata")
        .and_then(|m| m.child(OAI_DC_NS, "dc"))
        .map(|dc| {
            dc.children
                .iter()
                .filter_map(|field| {
                    let value = field.trimmed_text()?;
                    let namespace = match field.namespace.as_deref() {
                        Some(DC_NS) => FieldNamespace::Elements,
                        Some(DCTERMS_NS) => FieldNamespace::Terms,
                        other => FieldNamespace::Other(other.unwrap_or_default().to_string()),
                    };
                    Some(RawField {
                        namespace,
                        name: field.name.clone(),
                        value,
                        language: field
                            .attr("xml:lang")
                            .map(|l| l.trim().to_string())
                            .filter(|l| !l.is_empty()),
                    })
                })
                .collect()
        });

    record
}

/// Parses one `ListRecords` response page.
///
/// `noRecordsMatch` yields an empty, final page; any other OAI error code is an error.
pub fn parse_list_records(xml: &str) -> Result<RecordPage, ParseError> {
    let root = parse_envelope(xml)?;

    if let Some(err) = oai_error(&root) {
        return match err {
            ParseError::Oai { ref code, .. } if code == NO_RECORDS_MATCH => {
                Ok(RecordPage::default())
            }
            other => Err(other),
        };
    }

    let list = root.child(OAI_NS, "ListRecords").ok_or_else(|| {
        ParseError::Unexpected("response did not contain a ListRecords element".to_string())
    })?;

    let records = list
        .children_named(OAI_NS, "record")
        .map(parse_record)
        .collect();

    let token_node = list.child(OAI_NS, "resumptionToken");
    Ok(RecordPage {
        records,
        resumption_token: token_node.and_then(|t| t.trimmed_text()),
        complete_list_size: token_node
            .and_then(|t| t.attr("completeListSize"))
            .and_then(|s| s.trim().parse().ok()),
    })
}

/// Parses an `Identify` response.
pub fn parse_identify(xml: &str) -> Result<IdentifyInfo, ParseError> {
    let root = parse_envelope(xml)?;
    if let Some(err) = oai_error(&root) {
        return Err(err);
    }
    let identify = root.child(OAI_NS, "Identify").ok_or_else(|| {
        ParseError::Unexpected("The endpoint did not return an Identify response.".to_string())
    })?;
    Ok(IdentifyInfo {
        repository_name: identify.child_text(OAI_NS, "repositoryName"),
        base_url: identify.child_text(OAI_NS, "baseURL"),
        earliest_datestamp: identify.child_text(OAI_NS, "earliestDatestamp"),
    })
}
