//! Object-reference marshalling hooks.
//!
//! The stream serializes and deserializes a reference; resolving it to a
//! live proxy is the proxy layer's job, not ours. A missing reference (the
//! null proxy) travels as an empty identity.

use crate::error::Result;
use crate::stream::Stream;

/// Identity of a remote object: a name qualified by an optional category.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identity {
    pub name: String,
    pub category: String,
}

/// A serialized object reference. Resolution against a registry or locator
/// happens in the proxy collaborator, never here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRef {
    pub identity: Identity,
    /// Facet selector; empty selects the default facet.
    pub facet: String,
}

impl ProxyRef {
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            identity: Identity {
                name: name.into(),
                category: category.into(),
            },
            facet: String::new(),
        }
    }
}

impl Stream<'_> {
    /// Marshal an object reference; `None` encodes as the null proxy.
    pub fn write_proxy(&mut self, proxy: Option<&ProxyRef>) -> Result<()> {
        match proxy {
            Some(p) => {
                // A live reference always has a non-empty identity name;
                // the empty identity is reserved for the null proxy.
                debug_assert!(!p.identity.name.is_empty());
                self.write_string(&p.identity.name)?;
                self.write_string(&p.identity.category)?;
                self.write_string(&p.facet)
            }
            None => {
                self.write_string("")?;
                self.write_string("")
            }
        }
    }

    /// Unmarshal an object reference written by [`write_proxy`].
    ///
    /// [`write_proxy`]: Stream::write_proxy
    pub fn read_proxy(&mut self) -> Result<Option<ProxyRef>> {
        let name = self.read_string()?;
        let category = self.read_string()?;
        if name.is_empty() && category.is_empty() {
            return Ok(None);
        }
        let facet = self.read_string()?;
        Ok(Some(ProxyRef {
            identity: Identity { name, category },
            facet,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Instance;

    #[test]
    fn proxy_roundtrip() {
        let inst = Instance::default();
        let mut s = Stream::new(&inst);
        let mut proxy = ProxyRef::new("printer", "office");
        proxy.facet = "admin".to_string();
        s.write_proxy(Some(&proxy)).unwrap();
        assert_eq!(s.read_proxy().unwrap(), Some(proxy));
    }

    #[test]
    fn null_proxy_roundtrip() {
        let inst = Instance::default();
        let mut s = Stream::new(&inst);
        s.write_proxy(None).unwrap();
        assert_eq!(s.read_proxy().unwrap(), None);
        assert_eq!(s.remaining(), 0);
    }
}
