//! Acceptors - predicates deciding whether a processor takes a message
//!
//! Membership in a service's acceptor list is by configuration equality,
//! so two `ExactMatch` acceptors with the same field and expression are the
//! same acceptor. Custom acceptors compare by name.

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use rg_common::{GatewayError, Message, Result};

/// User-supplied acceptance logic. Must not block on I/O.
pub trait AcceptorPredicate: Send + Sync {
    fn accepts(&self, message: &Message) -> bool;
}

impl<F> AcceptorPredicate for F
where
    F: Fn(&Message) -> bool + Send + Sync,
{
    fn accepts(&self, message: &Message) -> bool {
        self(message)
    }
}

#[derive(Clone)]
pub enum Acceptor {
    AcceptAll,
    /// Property `field` rendered as text equals `expression`
    ExactMatch { field: String, expression: String },
    /// Property `field` rendered as text fully matches the pattern
    RegExp { field: String, pattern: String, regex: Regex },
    /// Every inner acceptor must accept
    And(Vec<Acceptor>),
    Custom { name: String, predicate: Arc<dyn AcceptorPredicate> },
}

impl Acceptor {
    pub fn exact_match(field: impl Into<String>, expression: impl Into<String>) -> Self {
        Acceptor::ExactMatch {
            field: field.into(),
            expression: expression.into(),
        }
    }

    pub fn regexp(field: impl Into<String>, pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
            GatewayError::invalid_argument(format!("invalid acceptor regexp '{}': {}", pattern, e))
        })?;
        Ok(Acceptor::RegExp {
            field: field.into(),
            pattern,
            regex,
        })
    }

    pub fn custom(name: impl Into<String>, predicate: impl AcceptorPredicate + 'static) -> Self {
        Acceptor::Custom {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn accepts(&self, message: &Message) -> bool {
        match self {
            Acceptor::AcceptAll => true,
            Acceptor::ExactMatch { field, expression } => {
                message.get_string(field).as_deref() == Some(expression.as_str())
            }
            Acceptor::RegExp { field, regex, .. } => message
                .get_string(field)
                .map(|value| regex.is_match(&value))
                .unwrap_or(false),
            Acceptor::And(acceptors) => acceptors.iter().all(|a| a.accepts(message)),
            Acceptor::Custom { predicate, .. } => predicate.accepts(message),
        }
    }
}

impl PartialEq for Acceptor {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Acceptor::AcceptAll, Acceptor::AcceptAll) => true,
            (
                Acceptor::ExactMatch { field: f1, expression: e1 },
                Acceptor::ExactMatch { field: f2, expression: e2 },
            ) => f1 == f2 && e1 == e2,
            (
                Acceptor::RegExp { field: f1, pattern: p1, .. },
                Acceptor::RegExp { field: f2, pattern: p2, .. },
            ) => f1 == f2 && p1 == p2,
            (Acceptor::And(a), Acceptor::And(b)) => a == b,
            (Acceptor::Custom { name: n1, .. }, Acceptor::Custom { name: n2, .. }) => n1 == n2,
            _ => false,
        }
    }
}

impl Eq for Acceptor {}

impl fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Acceptor::AcceptAll => write!(f, "AcceptAll"),
            Acceptor::ExactMatch { field, expression } => {
                write!(f, "ExactMatch({} == {:?})", field, expression)
            }
            Acceptor::RegExp { field, pattern, .. } => write!(f, "RegExp({} =~ /{}/)", field, pattern),
            Acceptor::And(acceptors) => f.debug_tuple("And").field(acceptors).finish(),
            Acceptor::Custom { name, .. } => write!(f, "Custom({})", name),
        }
    }
}

/// AND over a list; an empty list accepts everything
pub fn accepts_all(acceptors: &[Acceptor], message: &Message) -> bool {
    acceptors.iter().all(|a| a.accepts(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let acceptor = Acceptor::exact_match("to", "1234");

        assert!(acceptor.accepts(&Message::new().property("to", "1234")));
        assert!(!acceptor.accepts(&Message::new().property("to", "12345")));
        assert!(!acceptor.accepts(&Message::new()));
    }

    #[test]
    fn test_regexp_requires_full_match() {
        let acceptor = Acceptor::regexp("to", "57[0-9]{3}").unwrap();

        assert!(acceptor.accepts(&Message::new().property("to", "57300")));
        assert!(!acceptor.accepts(&Message::new().property("to", "5730012")));
        assert!(!acceptor.accepts(&Message::new().property("to", "x57300")));
    }

    #[test]
    fn test_regexp_matches_numeric_properties() {
        let acceptor = Acceptor::regexp("code", "4[0-9]+").unwrap();
        assert!(acceptor.accepts(&Message::new().property("code", 404)));
    }

    #[test]
    fn test_invalid_regexp_is_rejected() {
        let result = Acceptor::regexp("to", "([");
        assert!(matches!(result, Err(GatewayError::InvalidArgument { .. })));
    }

    #[test]
    fn test_and_acceptor() {
        let acceptor = Acceptor::And(vec![
            Acceptor::exact_match("to", "1234"),
            Acceptor::exact_match("from", "555"),
        ]);

        assert!(acceptor.accepts(&Message::new().property("to", "1234").property("from", "555")));
        assert!(!acceptor.accepts(&Message::new().property("to", "1234")));
        assert!(Acceptor::And(vec![]).accepts(&Message::new()));
    }

    #[test]
    fn test_structural_equality() {
        assert_eq!(Acceptor::exact_match("to", "1"), Acceptor::exact_match("to", "1"));
        assert_ne!(Acceptor::exact_match("to", "1"), Acceptor::exact_match("to", "2"));
        assert_eq!(
            Acceptor::regexp("to", "[0-9]+").unwrap(),
            Acceptor::regexp("to", "[0-9]+").unwrap()
        );

        let a = Acceptor::custom("vip", |m: &Message| m.get_str("vip").is_some());
        let b = Acceptor::custom("vip", |_: &Message| false);
        assert_eq!(a, b);
    }

    #[test]
    fn test_custom_predicate() {
        let acceptor = Acceptor::custom("long-text", |m: &Message| {
            m.get_str("text").map(|t| t.len() > 5).unwrap_or(false)
        });

        assert!(acceptor.accepts(&Message::new().property("text", "hello world")));
        assert!(!acceptor.accepts(&Message::new().property("text", "hi")));
    }
}
