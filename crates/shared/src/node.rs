//! The parsed protocol tree: every request, response and message exchanged
//! with the relay is a `Node`.
//!
//! A node has a tag, a typed attribute map, and either raw bytes or an ordered
//! list of children (never both). Wire serialization lives behind
//! [`crate::codec::NodeCodec`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::NodeError;
use crate::ids::{DeviceAddress, GroupId, Jid, UserId};

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum AttrValue {
    Str(String),
    Int(u64),
    Bytes(Vec<u8>),
    Jid(Jid),
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Str(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Str(value)
    }
}

impl From<u64> for AttrValue {
    fn from(value: u64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<u32> for AttrValue {
    fn from(value: u32) -> Self {
        AttrValue::Int(u64::from(value))
    }
}

impl From<Vec<u8>> for AttrValue {
    fn from(value: Vec<u8>) -> Self {
        AttrValue::Bytes(value)
    }
}

impl From<Jid> for AttrValue {
    fn from(value: Jid) -> Self {
        AttrValue::Jid(value)
    }
}

impl From<UserId> for AttrValue {
    fn from(value: UserId) -> Self {
        AttrValue::Jid(Jid::User(value))
    }
}

impl From<DeviceAddress> for AttrValue {
    fn from(value: DeviceAddress) -> Self {
        AttrValue::Jid(Jid::Device(value))
    }
}

impl From<GroupId> for AttrValue {
    fn from(value: GroupId) -> Self {
        AttrValue::Jid(Jid::Group(value))
    }
}

/// Node payload: nothing, raw bytes, or child nodes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Content {
    #[default]
    None,
    Bytes(Vec<u8>),
    Children(Vec<Node>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub tag: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, AttrValue>,
    #[serde(default)]
    pub content: Content,
}

impl Node {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: BTreeMap::new(),
            content: Content::None,
        }
    }

    /// Builder-style attribute setter.
    pub fn attr(mut self, key: &str, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }

    /// Set an attribute only when `value` is present.
    pub fn opt_attr<V: Into<AttrValue>>(self, key: &str, value: Option<V>) -> Self {
        match value {
            Some(v) => self.attr(key, v),
            None => self,
        }
    }

    pub fn with_children(mut self, children: Vec<Node>) -> Self {
        self.content = Content::Children(children);
        self
    }

    pub fn with_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.content = Content::Bytes(bytes.into());
        self
    }

    /// Append a child, converting byte or empty content into a child list.
    pub fn push_child(&mut self, child: Node) {
        match &mut self.content {
            Content::Children(children) => children.push(child),
            _ => self.content = Content::Children(vec![child]),
        }
    }

    pub fn children(&self) -> &[Node] {
        match &self.content {
            Content::Children(children) => children,
            _ => &[],
        }
    }

    pub fn child(&self, tag: &str) -> Option<&Node> {
        self.children().iter().find(|c| c.tag == tag)
    }

    pub fn children_by_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children().iter().filter(move |c| c.tag == tag)
    }

    pub fn require_child(&self, tag: &str) -> Result<&Node, NodeError> {
        self.child(tag).ok_or_else(|| NodeError::MissingChild {
            tag: self.tag.clone(),
            child: tag.to_string(),
        })
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.content {
            Content::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn require_bytes(&self) -> Result<&[u8], NodeError> {
        self.bytes().ok_or_else(|| NodeError::MissingContent {
            tag: self.tag.clone(),
        })
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.attrs.get(key) {
            Some(AttrValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn str_attr(&self, key: &str) -> Result<&str, NodeError> {
        match self.attrs.get(key) {
            Some(AttrValue::Str(s)) => Ok(s),
            Some(_) => Err(self.wrong_type(key, "string")),
            None => Err(self.missing(key)),
        }
    }

    /// Integer attribute; numeric strings are accepted as well.
    pub fn u64_attr(&self, key: &str) -> Result<u64, NodeError> {
        self.opt_u64_attr(key)?.ok_or_else(|| self.missing(key))
    }

    pub fn opt_u64_attr(&self, key: &str) -> Result<Option<u64>, NodeError> {
        match self.attrs.get(key) {
            Some(AttrValue::Int(v)) => Ok(Some(*v)),
            Some(AttrValue::Str(s)) => s
                .parse()
                .map(Some)
                .map_err(|_| self.wrong_type(key, "integer")),
            Some(_) => Err(self.wrong_type(key, "integer")),
            None => Ok(None),
        }
    }

    pub fn jid_attr(&self, key: &str) -> Result<Jid, NodeError> {
        self.opt_jid_attr(key)?.ok_or_else(|| self.missing(key))
    }

    pub fn opt_jid_attr(&self, key: &str) -> Result<Option<Jid>, NodeError> {
        match self.attrs.get(key) {
            Some(AttrValue::Jid(jid)) => Ok(Some(*jid)),
            Some(_) => Err(self.wrong_type(key, "jid")),
            None => Ok(None),
        }
    }

    pub fn bytes_attr(&self, key: &str) -> Result<&[u8], NodeError> {
        match self.attrs.get(key) {
            Some(AttrValue::Bytes(b)) => Ok(b),
            Some(_) => Err(self.wrong_type(key, "bytes")),
            None => Err(self.missing(key)),
        }
    }

    fn missing(&self, key: &str) -> NodeError {
        NodeError::MissingAttr {
            tag: self.tag.clone(),
            attr: key.to_string(),
        }
    }

    fn wrong_type(&self, key: &str, expected: &'static str) -> NodeError {
        NodeError::WrongAttrType {
            tag: self.tag.clone(),
            attr: key.to_string(),
            expected,
        }
    }
}
