//! Structured resource description returned by `GetResourceDescription`.
//!
//! A chassis `ResourceInfo` owns one child per port. Rendering follows the
//! controller's `ResourceInfo` element layout: `ChildResources`,
//! `ResourceAttributes` and an optional `ResourceMapping`.

use std::fmt::Write as _;

use crate::codec::escape;

/// Attribute value type as understood by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeType {
    String,
    Lookup,
    Double,
}

impl AttributeType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::String => "String",
            Self::Lookup => "Lookup",
            Self::Double => "Double",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub kind: AttributeType,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub name: String,
    pub address: String,
    pub family: String,
    pub model: String,
    pub serial: String,
    /// Address of the resource mapped into this one, if any.
    pub map_path: Option<String>,
    pub children: Vec<ResourceInfo>,
    /// Insertion ordered; setting an existing name replaces its value.
    pub attributes: Vec<Attribute>,
}

impl ResourceInfo {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        family: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            family: family.into(),
            model: model.into(),
            serial: "-1".to_string(),
            map_path: None,
            children: Vec::new(),
            attributes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = serial.into();
        self
    }

    #[must_use]
    pub fn with_map_path(mut self, map_path: Option<String>) -> Self {
        self.map_path = map_path;
        self
    }

    pub fn add_child(&mut self, child: Self) {
        self.children.push(child);
    }

    pub fn set_attribute(&mut self, name: &str, value: impl ToString, kind: AttributeType) {
        let value = value.to_string();
        if let Some(a) = self.attributes.iter_mut().find(|a| a.name == name) {
            a.value = value;
            a.kind = kind;
        } else {
            self.attributes.push(Attribute {
                name: name.to_string(),
                kind,
                value,
            });
        }
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Depth-first search by address (self included).
    #[must_use]
    pub fn find(&self, address: &str) -> Option<&Self> {
        if self.address == address {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(address))
    }

    /// Render as a `ResourceInfo` XML element indented by `depth` levels.
    #[must_use]
    pub fn to_xml(&self, depth: usize) -> String {
        let mut out = String::new();
        self.write_xml(&mut out, depth);
        out
    }

    fn write_xml(&self, out: &mut String, depth: usize) {
        let pad = "    ".repeat(depth);
        // writes into a String cannot fail
        let _ = writeln!(
            out,
            "{pad}<ResourceInfo Name=\"{}\" Address=\"{}\" ResourceFamilyName=\"{}\" ResourceModelName=\"{}\" SerialNumber=\"{}\">",
            escape(&self.name),
            escape(&self.address),
            escape(&self.family),
            escape(&self.model),
            escape(&self.serial),
        );
        let _ = writeln!(out, "{pad}    <ChildResources>");
        for child in &self.children {
            child.write_xml(out, depth + 2);
        }
        let _ = writeln!(out, "{pad}    </ChildResources>");
        let _ = writeln!(out, "{pad}    <ResourceAttributes>");
        for a in &self.attributes {
            let _ = writeln!(
                out,
                "{pad}        <Attribute Name=\"{}\" Type=\"{}\" Value=\"{}\" />",
                escape(&a.name),
                a.kind.as_str(),
                escape(&a.value),
            );
        }
        let _ = writeln!(out, "{pad}    </ResourceAttributes>");
        if let Some(map_path) = &self.map_path {
            let _ = writeln!(
                out,
                "{pad}    <ResourceMapping><IncomingMapping>{}</IncomingMapping></ResourceMapping>",
                escape(map_path)
            );
        }
        let _ = writeln!(out, "{pad}</ResourceInfo>");
    }
}
