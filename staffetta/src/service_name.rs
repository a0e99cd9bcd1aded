use anyhow::Context;

/// Identifies a logical gRPC service, e.g. `pkg.Tester`.
///
/// The name doubles as the key under which server instances register
/// themselves in the coordination store, and as the hostname handed to
/// DNS-based discovery backends. It is therefore validated as a domain
/// name at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceName(String);

impl ServiceName {
    /// Create a [`ServiceName`] from a dotted service identifier.
    ///
    /// This function will fail if the name is empty or not a valid domain name.
    pub fn new<T: ToString>(name: T) -> Result<Self, anyhow::Error> {
        let name = name.to_string();

        if name.is_empty() {
            anyhow::bail!("service name must not be empty");
        }

        trust_dns_resolver::proto::rr::Name::from_ascii(&name)
            .map_err(anyhow::Error::from)
            .context("invalid service name")?;

        Ok(Self(name))
    }

    /// View the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServiceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// ```
/// let name = staffetta::ServiceName::try_from("pkg.Tester").unwrap();
/// assert_eq!(name.as_str(), "pkg.Tester");
/// ```
impl TryFrom<&str> for ServiceName {
    type Error = anyhow::Error;

    fn try_from(name: &str) -> Result<Self, Self::Error> {
        Self::new(name)
    }
}

/// ```
/// let name = staffetta::ServiceName::try_from(String::from("pkg.Tester")).unwrap();
/// assert_eq!(name.as_str(), "pkg.Tester");
/// ```
impl TryFrom<String> for ServiceName {
    type Error = anyhow::Error;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Self::new(name)
    }
}
