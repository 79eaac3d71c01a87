//! External schema resolver: discovers the schema-location URL on the
//! document root, downloads it, parses the element declarations, and caches
//! the parsed schema for the process lifetime.
//!
//! Any failure along the way (no URL, resolver disabled, download failure,
//! parse failure) yields `None`; only `mode: external` escalates that into
//! an error, and that decision belongs to the caller.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use lazy_static::lazy_static;
use tracing::{debug, info, warn};

use xsink_core::{kind_from_type_name, DataKind, FieldDef, ResolverSpec, XsinkError};
use xsink_io::source_xml::XmlRecordSource;

/// Upper bound on element occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occurs {
    Bounded(u32),
    Unbounded,
}

/// One parsed `element` declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtElement {
    pub name: String,
    pub kind: DataKind,
    pub min_occurs: u32,
    pub max_occurs: Occurs,
    pub nillable: bool,
}

impl ExtElement {
    pub fn is_array(&self) -> bool {
        match self.max_occurs {
            Occurs::Unbounded => true,
            Occurs::Bounded(n) => n > 1,
        }
    }

    pub fn is_required(&self) -> bool {
        self.min_occurs > 0
    }

    /// The schema field this declaration contributes.
    pub fn to_field(&self) -> FieldDef {
        FieldDef {
            name: self.name.clone(),
            kind: self.kind.clone(),
            nullable: !self.is_required() || self.nillable,
            repeating: self.is_array(),
        }
    }
}

/// A parsed external schema in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalSchema {
    pub source_url: String,
    pub elements: Vec<ExtElement>,
    pub target_namespace: Option<String>,
}

impl ExternalSchema {
    pub fn element(&self, name: &str) -> Option<&ExtElement> {
        self.elements.iter().find(|e| e.name == name)
    }
}

lazy_static! {
    // Process-lifetime URL -> schema cache. Entries are immutable once
    // installed and never evicted; insert-if-absent keeps the first writer.
    static ref SCHEMA_CACHE: RwLock<HashMap<String, Arc<ExternalSchema>>> =
        RwLock::new(HashMap::new());
}

fn cache_get(url: &str) -> Option<Arc<ExternalSchema>> {
    SCHEMA_CACHE.read().ok()?.get(url).cloned()
}

fn cache_put(url: &str, schema: Arc<ExternalSchema>) -> Arc<ExternalSchema> {
    let Ok(mut cache) = SCHEMA_CACHE.write() else {
        return schema;
    };
    cache.entry(url.to_string()).or_insert(schema).clone()
}

/// Resolves the external schema for a document: probe the root for a
/// schema-location URL, hit the cache, otherwise download and parse.
pub async fn resolve(path: &Path, spec: &ResolverSpec) -> Option<Arc<ExternalSchema>> {
    if !spec.enabled {
        debug!("schema resolver disabled");
        return None;
    }
    let url = match XmlRecordSource::schema_location_hint(path) {
        Ok(Some(url)) => url,
        Ok(None) => {
            debug!("no schema location on document root");
            return None;
        }
        Err(e) => {
            warn!("schema location probe failed: {e}");
            return None;
        }
    };
    if let Some(cached) = cache_get(&url) {
        debug!(url = %url, "external schema cache hit");
        return Some(cached);
    }
    match fetch_and_parse(&url, spec.timeout_secs).await {
        Ok(schema) => {
            info!(url = %url, elements = schema.elements.len(), "external schema resolved");
            Some(cache_put(&url, Arc::new(schema)))
        }
        Err(e) => {
            warn!(url = %url, "external schema resolution failed: {e}");
            None
        }
    }
}

async fn fetch_and_parse(url: &str, timeout_secs: u64) -> Result<ExternalSchema> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .context("build schema http client")?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| XsinkError::Resolution(format!("download failed: {e}")))?;
    if !response.status().is_success() {
        return Err(anyhow!(XsinkError::Resolution(format!(
            "download failed with status: {}",
            response.status()
        ))));
    }
    let body = response
        .text()
        .await
        .map_err(|e| XsinkError::Resolution(format!("download failed: {e}")))?;
    parse_xsd(&body, url)
}

/// Parses an XSD body into element declarations. The walk collects
/// `element` nodes at the top level and inside `complexType` containers,
/// descending through `sequence`, `choice` and `all`. No validation of the
/// schema itself is performed.
pub fn parse_xsd(text: &str, url: &str) -> Result<ExternalSchema> {
    let doc = roxmltree::Document::parse(text)
        .map_err(|e| XsinkError::Resolution(format!("schema parse failed: {e}")))?;
    let root = doc.root_element();
    if root.tag_name().name() != "schema" {
        return Err(anyhow!(XsinkError::Resolution(format!(
            "expected a schema document, found <{}>",
            root.tag_name().name()
        ))));
    }
    let mut elements = Vec::new();
    collect_elements(root, &mut elements);
    Ok(ExternalSchema {
        source_url: url.to_string(),
        elements,
        target_namespace: root.attribute("targetNamespace").map(str::to_string),
    })
}

const CONTAINER_TAGS: [&str; 4] = ["complexType", "sequence", "choice", "all"];

fn collect_elements(node: roxmltree::Node<'_, '_>, out: &mut Vec<ExtElement>) {
    for child in node.children().filter(|c| c.is_element()) {
        let tag = child.tag_name().name();
        if tag == "element" {
            if let Some(element) = parse_element(child) {
                out.push(element);
            }
            // An inline complexType folds into the Struct kind above, and
            // its element declarations still join the flat list.
            collect_elements(child, out);
        } else if CONTAINER_TAGS.contains(&tag) {
            collect_elements(child, out);
        }
    }
}

fn parse_element(node: roxmltree::Node<'_, '_>) -> Option<ExtElement> {
    let name = node.attribute("name")?.to_string();
    let min_occurs = node
        .attribute("minOccurs")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);
    let max_occurs = match node.attribute("maxOccurs") {
        Some("unbounded") => Occurs::Unbounded,
        Some(v) => Occurs::Bounded(v.parse().unwrap_or(1)),
        None => Occurs::Bounded(1),
    };
    let nillable = node.attribute("nillable") == Some("true");

    let inline_complex = node
        .children()
        .find(|c| c.is_element() && c.tag_name().name() == "complexType");
    let kind = match (node.attribute("type"), inline_complex) {
        (_, Some(complex)) => {
            let mut nested = Vec::new();
            collect_elements(complex, &mut nested);
            DataKind::Struct(nested.iter().map(ExtElement::to_field).collect())
        }
        (Some(type_name), None) => kind_from_type_name(type_name),
        (None, None) => DataKind::Str,
    };

    Some(ExtElement {
        name,
        kind,
        min_occurs,
        max_occurs,
        nillable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const BOOKS_XSD: &str = r#"
<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema" targetNamespace="urn:books">
  <xs:element name="catalog">
    <xs:complexType>
      <xs:sequence>
        <xs:element name="book" maxOccurs="unbounded">
          <xs:complexType>
            <xs:sequence>
              <xs:element name="title" type="xs:string"/>
              <xs:element name="year" type="xs:int" minOccurs="0"/>
              <xs:element name="price" type="xs:decimal" nillable="true"/>
            </xs:sequence>
          </xs:complexType>
        </xs:element>
      </xs:sequence>
    </xs:complexType>
  </xs:element>
</xs:schema>"#;

    #[test]
    fn parses_nested_element_declarations() {
        let schema = parse_xsd(BOOKS_XSD, "http://example.com/books.xsd").unwrap();
        assert_eq!(schema.target_namespace.as_deref(), Some("urn:books"));

        // Every element declaration joins the flat list: catalog at the
        // top, book inside its complexType, and book's own children.
        let names: Vec<&str> = schema.elements.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["catalog", "book", "title", "year", "price"]);

        let book = schema.element("book").unwrap();
        assert!(book.is_array());
        assert!(book.is_required());
        let DataKind::Struct(fields) = &book.kind else {
            panic!("book must be a struct");
        };
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0].name, "title");
        assert_eq!(fields[0].kind, DataKind::Str);
        assert!(!fields[0].nullable);
        assert_eq!(fields[1].kind, DataKind::I32);
        assert!(fields[1].nullable);
        assert_eq!(fields[2].kind, DataKind::Decimal { precision: 10, scale: 2 });
        assert!(fields[2].nullable);
    }

    #[test]
    fn occurrence_attributes_drive_array_and_required_flags() {
        let xsd = r#"
<schema>
  <element name="a" type="string" minOccurs="0" maxOccurs="3"/>
  <element name="b" type="long"/>
</schema>"#;
        let schema = parse_xsd(xsd, "http://example.com/x.xsd").unwrap();
        let a = schema.element("a").unwrap();
        assert!(a.is_array());
        assert!(!a.is_required());
        let field = a.to_field();
        assert!(field.repeating);
        assert!(field.nullable);

        let b = schema.element("b").unwrap();
        assert_eq!(b.kind, DataKind::I64);
        assert!(!b.to_field().nullable);
    }

    #[test]
    fn non_schema_document_is_a_resolution_error() {
        let err = parse_xsd("<html></html>", "http://example.com/x").unwrap_err();
        assert!(err.to_string().contains("schema document"));
    }

    #[test]
    fn malformed_schema_is_a_resolution_error() {
        assert!(parse_xsd("<schema><oops>", "http://example.com/x").is_err());
    }

    #[test]
    fn cache_is_monotonic_within_the_process() {
        let schema = Arc::new(ExternalSchema {
            source_url: "http://example.com/cache-test.xsd".into(),
            elements: vec![],
            target_namespace: None,
        });
        let installed = cache_put("http://example.com/cache-test.xsd", schema.clone());
        assert_eq!(installed, schema);

        // A second insert keeps the first entry.
        let other = Arc::new(ExternalSchema {
            source_url: "http://example.com/cache-test.xsd".into(),
            elements: vec![],
            target_namespace: Some("urn:other".into()),
        });
        let kept = cache_put("http://example.com/cache-test.xsd", other);
        assert_eq!(kept, schema);
        assert_eq!(cache_get("http://example.com/cache-test.xsd"), Some(schema));
    }

    #[tokio::test]
    async fn disabled_resolver_yields_none() {
        let spec = ResolverSpec {
            enabled: false,
            timeout_secs: 1,
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.xml");
        std::fs::write(&path, "<root/>").unwrap();
        assert!(resolve(&path, &spec).await.is_none());
    }

    #[tokio::test]
    async fn document_without_location_yields_none() {
        let spec = ResolverSpec {
            enabled: true,
            timeout_secs: 1,
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.xml");
        std::fs::write(&path, "<root><a/></root>").unwrap();
        assert!(resolve(&path, &spec).await.is_none());
    }
}
