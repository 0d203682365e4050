/// Errors raised while reading a `Node` or decoding a frame into one.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("<{tag}> is missing attribute {attr:?}")]
    MissingAttr { tag: String, attr: String },

    #[error("<{tag}> attribute {attr:?} has the wrong type: expected {expected}")]
    WrongAttrType {
        tag: String,
        attr: String,
        expected: &'static str,
    },

    #[error("<{tag}> is missing child <{child}>")]
    MissingChild { tag: String, child: String },

    #[error("<{tag}> has no byte content")]
    MissingContent { tag: String },

    #[error("unexpected node <{0}>")]
    Unexpected(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_attr_names_tag_and_attribute() {
        let err = NodeError::MissingAttr {
            tag: "iq".into(),
            attr: "id".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("<iq>"));
        assert!(msg.contains("\"id\""));
    }

    #[test]
    fn all_variants_impl_error() {
        let errors: Vec<Box<dyn std::error::Error>> = vec![
            Box::new(NodeError::MissingAttr {
                tag: "a".into(),
                attr: "b".into(),
            }),
            Box::new(NodeError::WrongAttrType {
                tag: "a".into(),
                attr: "b".into(),
                expected: "int",
            }),
            Box::new(NodeError::MissingChild {
                tag: "a".into(),
                child: "b".into(),
            }),
            Box::new(NodeError::MissingContent { tag: "a".into() }),
            Box::new(NodeError::Unexpected("x".into())),
            Box::new(NodeError::Codec("y".into())),
        ];
        for e in &errors {
            let _ = e.to_string();
        }
    }
}
