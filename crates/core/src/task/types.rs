use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

/// Kind of destination a configuration delivers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    /// Another database instance.
    Peer,
    /// A relational store.
    Relational,
}

impl DestinationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationKind::Peer => "peer",
            DestinationKind::Relational => "relational",
        }
    }
}

impl std::fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key standing for every collection in per-collection reports.
pub const ALL_COLLECTIONS: &str = "*";

/// Which collections a transformation reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "collections", rename_all = "snake_case")]
pub enum CollectionFilter {
    All,
    Only(Vec<String>),
}

impl CollectionFilter {
    pub fn only<I, S>(collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only(collections.into_iter().map(Into::into).collect())
    }

    pub fn is_all(&self) -> bool {
        matches!(self, CollectionFilter::All)
    }

    /// Explicit collections, empty for `All`.
    pub fn collections(&self) -> &[String] {
        match self {
            CollectionFilter::All => &[],
            CollectionFilter::Only(collections) => collections,
        }
    }

    /// Collection names compare case-insensitively. Items without a
    /// collection only match `All`.
    pub fn applies_to(&self, collection: Option<&str>) -> bool {
        match (self, collection) {
            (CollectionFilter::All, _) => true,
            (CollectionFilter::Only(_), None) => false,
            (CollectionFilter::Only(collections), Some(name)) => {
                collections.iter().any(|c| c.eq_ignore_ascii_case(name))
            }
        }
    }
}

/// A named script scoped inside one configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transformation {
    pub name: String,
    pub script: String,
    pub collections: CollectionFilter,
    #[serde(default)]
    pub disabled: bool,
}

impl Transformation {
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            collections: CollectionFilter::All,
            disabled: false,
        }
    }

    pub fn with_collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections = CollectionFilter::only(collections);
        self
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }
}

/// One ETL task definition: a destination plus its transformations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtlConfiguration {
    pub name: String,
    pub kind: DestinationKind,
    pub connection_string_name: String,
    pub transformations: Vec<Transformation>,
    #[serde(default)]
    pub disabled: bool,
    /// Allow an unencrypted channel from an encrypted database.
    #[serde(default)]
    pub allow_etl_on_non_encrypted_channel: bool,
}

impl EtlConfiguration {
    pub fn new(
        name: impl Into<String>,
        kind: DestinationKind,
        connection_string_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            connection_string_name: connection_string_name.into(),
            transformations: Vec::new(),
            disabled: false,
            allow_etl_on_non_encrypted_channel: false,
        }
    }

    pub fn with_transformation(mut self, transformation: Transformation) -> Self {
        self.transformations.push(transformation);
        self
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn with_non_encrypted_channel_allowed(mut self, allowed: bool) -> Self {
        self.allow_etl_on_non_encrypted_channel = allowed;
        self
    }

    pub fn transformation(&self, name: &str) -> Option<&Transformation> {
        self.transformations
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// Union of the transformations' filters.
    pub fn collections(&self) -> CollectionFilter {
        if self.transformations.iter().any(|t| t.collections.is_all()) {
            return CollectionFilter::All;
        }

        let mut seen = HashSet::new();
        let mut collections = Vec::new();
        for name in self
            .transformations
            .iter()
            .flat_map(|t| t.collections.collections())
        {
            if seen.insert(name.to_lowercase()) {
                collections.push(name.clone());
            }
        }
        CollectionFilter::Only(collections)
    }

    /// Structural checks that do not need the rest of the database record.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("ETL configuration name cannot be empty".to_string());
        }
        if self.connection_string_name.trim().is_empty() {
            errors.push("Connection string name cannot be empty".to_string());
        }
        if self.transformations.is_empty() {
            errors.push("ETL configuration must define at least one transformation".to_string());
        }

        let mut names = HashSet::new();
        for transformation in &self.transformations {
            if transformation.name.trim().is_empty() {
                errors.push("Transformation name cannot be empty".to_string());
                continue;
            }
            if !names.insert(transformation.name.to_lowercase()) {
                errors.push(format!(
                    "Transformation name '{}' is used more than once",
                    transformation.name
                ));
            }
            if transformation.script.trim().is_empty() {
                errors.push(format!(
                    "Script of transformation '{}' cannot be empty",
                    transformation.name
                ));
            }
            if let CollectionFilter::Only(collections) = &transformation.collections {
                if collections.is_empty() {
                    errors.push(format!(
                        "Transformation '{}' must apply to all collections or name at least one",
                        transformation.name
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Where a configuration delivers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionString {
    pub name: String,
    pub kind: DestinationKind,
    pub url: String,
    /// Whether the channel to the destination is encrypted.
    #[serde(default)]
    pub encrypted: bool,
}

impl ConnectionString {
    pub fn new(name: impl Into<String>, kind: DestinationKind, url: impl Into<String>) -> Self {
        let url = url.into();
        let encrypted = url.starts_with("https://");
        Self {
            name: name.into(),
            kind,
            url,
            encrypted,
        }
    }

    pub fn with_encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }
}

/// Nodes currently serving the database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseTopology {
    pub members: Vec<String>,
}

impl DatabaseTopology {
    pub fn new<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, node_tag: &str) -> bool {
        self.members.iter().any(|m| m == node_tag)
    }
}

/// The distributed database record the registry reconciles against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseRecord {
    pub database_name: String,
    /// Whether the database itself is encrypted at rest.
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub topology: DatabaseTopology,
    #[serde(default)]
    pub connection_strings: BTreeMap<String, ConnectionString>,
    #[serde(default)]
    pub etl_configurations: Vec<EtlConfiguration>,
}

impl DatabaseRecord {
    pub fn new(database_name: impl Into<String>) -> Self {
        Self {
            database_name: database_name.into(),
            ..Default::default()
        }
    }

    pub fn with_encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    pub fn with_topology(mut self, topology: DatabaseTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_connection_string(mut self, connection: ConnectionString) -> Self {
        self.connection_strings
            .insert(connection.name.clone(), connection);
        self
    }

    pub fn with_configuration(mut self, configuration: EtlConfiguration) -> Self {
        self.etl_configurations.push(configuration);
        self
    }

    pub fn connection_string(&self, name: &str) -> Option<&ConnectionString> {
        self.connection_strings.get(name)
    }
}

/// A configuration with its connection string looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfiguration {
    pub configuration: EtlConfiguration,
    pub connection: ConnectionString,
}

impl ResolvedConfiguration {
    pub fn name(&self) -> &str {
        &self.configuration.name
    }

    pub fn kind(&self) -> DestinationKind {
        self.configuration.kind
    }

    /// Whether an engine built from `self` for `transformation` would behave
    /// exactly like one built from `other`. Sibling transformations do not matter.
    pub fn is_equivalent_for(&self, other: &ResolvedConfiguration, transformation: &str) -> bool {
        let a = &self.configuration;
        let b = &other.configuration;

        a.name == b.name
            && a.kind == b.kind
            && a.connection_string_name == b.connection_string_name
            && a.disabled == b.disabled
            && a.allow_etl_on_non_encrypted_channel == b.allow_etl_on_non_encrypted_channel
            && self.connection == other.connection
            && match (a.transformation(transformation), b.transformation(transformation)) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            }
    }
}
