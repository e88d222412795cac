//! Wire-level query and response model.
//!
//! These types are what the protocol collaborator hands the driver. Each
//! query validates itself before dispatch; responses carry the elapsed time
//! and an optional engine error. The response union is a tagged enum, not
//! open polymorphism.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::{Entity, Key, Value, ID_KEY};

/// Default result limit for queries that do not set paging explicitly.
pub const DEFAULT_PAGING_LIMIT: usize = 100;

/// Filter operators. `All` is valid only on the `id` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "><")]
    Between,
    #[serde(rename = "ALL")]
    All,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub property: String,
    pub operator: Operator,
    pub values: Vec<Value>,
}

impl Filter {
    pub fn new(property: impl Into<String>, operator: Operator, values: Vec<Value>) -> Self {
        Self {
            property: property.into(),
            operator,
            values,
        }
    }

    pub fn eq(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(property, Operator::Eq, vec![value.into()])
    }

    pub fn within(property: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(property, Operator::In, values)
    }

    pub fn between(
        property: impl Into<String>,
        min: impl Into<Value>,
        max: impl Into<Value>,
    ) -> Self {
        Self::new(property, Operator::Between, vec![min.into(), max.into()])
    }

    pub fn all() -> Self {
        Self::new(ID_KEY, Operator::All, Vec::new())
    }

    pub fn validate(&self) -> Result<()> {
        if self.property.is_empty() {
            return Err(Error::validation("no property given for filter"));
        }
        if self.values.is_empty() && self.operator != Operator::All {
            return Err(Error::validation("no values given for filter"));
        }
        match self.operator {
            Operator::Eq => {
                if self.values.len() > 1 {
                    return Err(Error::validation("too many values for equality filter"));
                }
            }
            Operator::Between => {
                if self.values.len() != 2 {
                    return Err(Error::validation(format!(
                        "BETWEEN filters take exactly 2 values, {} given",
                        self.values.len()
                    )));
                }
            }
            Operator::In => {}
            Operator::All => {
                if self.property != ID_KEY {
                    return Err(Error::validation("ALL is allowed only on the id property"));
                }
            }
        }
        Ok(())
    }
}

/// A set of filters keyed by property, one filter per property.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filters(BTreeMap<String, Filter>);

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, filter: Filter) -> Self {
        self.insert(filter);
        self
    }

    pub fn insert(&mut self, filter: Filter) {
        self.0.insert(filter.property.clone(), filter);
    }

    pub fn get(&self, property: &str) -> Option<&Filter> {
        self.0.get(property)
    }

    pub fn contains(&self, property: &str) -> bool {
        self.0.contains_key(property)
    }

    /// The sole filter, if there is exactly one.
    pub fn one(&self) -> Option<&Filter> {
        if self.0.len() == 1 {
            self.0.values().next()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Values<'_, String, Filter> {
        self.0.values()
    }

    pub fn validate(&self) -> Result<()> {
        for filter in self.0.values() {
            filter.validate()?;
        }
        Ok(())
    }
}

impl FromIterator<Filter> for Filters {
    fn from_iter<I: IntoIterator<Item = Filter>>(iter: I) -> Self {
        let mut filters = Self::new();
        for f in iter {
            filters.insert(f);
        }
        filters
    }
}

/// An ordering clause; an empty `by` means "index order".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ordering {
    pub by: String,
    pub ascending: bool,
}

impl Default for Ordering {
    fn default() -> Self {
        Self {
            by: String::new(),
            ascending: true,
        }
    }
}

impl Ordering {
    pub fn asc(by: impl Into<String>) -> Self {
        Self {
            by: by.into(),
            ascending: true,
        }
    }

    pub fn desc(by: impl Into<String>) -> Self {
        Self {
            by: by.into(),
            ascending: false,
        }
    }

    pub fn is_none(&self) -> bool {
        self.by.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paging {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Paging {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGING_LIMIT,
        }
    }
}

impl Paging {
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(Error::validation("paging limit must be positive"));
        }
        Ok(())
    }
}

/// Per-property change operations for UPDATE queries.
///
/// `SetAdd`/`SetDel`/`MapSet`/`MapDel` are declared wire ops the engine does
/// not support; they are rejected at validation. `Noop` is internal and
/// drives reindexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOp {
    #[serde(rename = "SET")]
    Set,
    #[serde(rename = "DEL")]
    Del,
    #[serde(rename = "EXP")]
    Expire,
    #[serde(rename = "INCR")]
    Increment,
    #[serde(rename = "PDEL")]
    PropDel,
    #[serde(rename = "SADD")]
    SetAdd,
    #[serde(rename = "SDEL")]
    SetDel,
    #[serde(rename = "MSET")]
    MapSet,
    #[serde(rename = "MDEL")]
    MapDel,
    #[serde(rename = "NOOP")]
    Noop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub property: String,
    pub value: Value,
    pub op: ChangeOp,
}

impl Change {
    pub fn set(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            property: property.into(),
            value: value.into(),
            op: ChangeOp::Set,
        }
    }

    pub fn increment(property: impl Into<String>, amount: i64) -> Self {
        Self {
            property: property.into(),
            value: Value::Int(amount),
            op: ChangeOp::Increment,
        }
    }

    pub fn del_property(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            value: Value::Nil,
            op: ChangeOp::PropDel,
        }
    }

    pub fn delete() -> Self {
        Self {
            property: String::new(),
            value: Value::Nil,
            op: ChangeOp::Del,
        }
    }

    pub fn expire(ttl: Duration) -> Self {
        Self {
            property: String::new(),
            value: Value::Uint(ttl.as_millis() as u64),
            op: ChangeOp::Expire,
        }
    }

    pub(crate) fn noop(property: impl Into<String>, value: Value) -> Self {
        Self {
            property: property.into(),
            value,
            op: ChangeOp::Noop,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.property.is_empty() && !matches!(self.op, ChangeOp::Expire | ChangeOp::Del) {
            return Err(Error::validation("no property name for change"));
        }
        match self.op {
            ChangeOp::Set
            | ChangeOp::Del
            | ChangeOp::Expire
            | ChangeOp::Increment
            | ChangeOp::PropDel => Ok(()),
            other => Err(Error::op_not_supported(format!("change op {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetQuery {
    pub table: String,
    pub properties: Vec<String>,
    pub filters: Filters,
    pub order: Ordering,
    pub paging: Paging,
}

impl GetQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.insert(filter);
        self
    }

    pub fn filter_eq(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::eq(property, value))
    }

    pub fn filter_in(self, property: impl Into<String>, values: Vec<Value>) -> Self {
        self.filter(Filter::within(property, values))
    }

    pub fn filter_between(
        self,
        property: impl Into<String>,
        min: impl Into<Value>,
        max: impl Into<Value>,
    ) -> Self {
        self.filter(Filter::between(property, min, max))
    }

    pub fn all(self) -> Self {
        self.filter(Filter::all())
    }

    pub fn fields(mut self, properties: &[&str]) -> Self {
        self.properties = properties.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn order_by(mut self, order: Ordering) -> Self {
        self.order = order;
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.paging = Paging { offset, limit };
        self
    }

    pub fn limit(self, limit: usize) -> Self {
        self.page(0, limit)
    }

    pub fn validate(&self) -> Result<()> {
        if self.table.is_empty() {
            return Err(Error::validation("no table for GET query"));
        }
        if self.filters.is_empty() {
            return Err(Error::validation("no filters for GET query"));
        }
        self.filters.validate()?;
        self.paging.validate()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PutQuery {
    pub table: String,
    pub entities: Vec<Entity>,
}

impl PutQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            entities: Vec::new(),
        }
    }

    pub fn entity(mut self, entity: Entity) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.table.is_empty() {
            return Err(Error::validation("no table for PUT query"));
        }
        if self.entities.is_empty() {
            return Err(Error::validation("no entities in PUT query"));
        }
        for entity in &self.entities {
            entity.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateQuery {
    pub table: String,
    pub filters: Filters,
    pub changes: Vec<Change>,
}

impl UpdateQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.insert(filter);
        self
    }

    pub fn set(mut self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.changes.push(Change::set(property, value));
        self
    }

    pub fn increment(mut self, property: impl Into<String>, amount: i64) -> Self {
        self.changes.push(Change::increment(property, amount));
        self
    }

    pub fn del_property(mut self, property: impl Into<String>) -> Self {
        self.changes.push(Change::del_property(property));
        self
    }

    pub fn expire(mut self, ttl: Duration) -> Self {
        self.changes.push(Change::expire(ttl));
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.table.is_empty() {
            return Err(Error::validation("no table for UPDATE query"));
        }
        if self.filters.is_empty() {
            return Err(Error::validation("no selection filters for UPDATE query"));
        }
        if self.changes.is_empty() {
            return Err(Error::validation("no changes in UPDATE query"));
        }
        self.filters.validate()?;
        for change in &self.changes {
            change.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DelQuery {
    pub table: String,
    pub filters: Filters,
}

impl DelQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filters: Filters::new(),
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.insert(filter);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.table.is_empty() {
            return Err(Error::validation("no table for DEL query"));
        }
        if self.filters.is_empty() {
            return Err(Error::validation("no selection filters for DEL query"));
        }
        self.filters.validate()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PingQuery;

#[derive(Debug, Default)]
pub struct GetResponse {
    pub entities: Vec<Entity>,
    /// Total matches for the filter set, regardless of paging.
    pub total: usize,
    pub elapsed: Duration,
    pub error: Option<Error>,
}

#[derive(Debug, Default)]
pub struct PutResponse {
    /// Ids in the same order as the entities of the request.
    pub ids: Vec<Key>,
    pub elapsed: Duration,
    pub error: Option<Error>,
}

#[derive(Debug, Default)]
pub struct UpdateResponse {
    pub num: usize,
    pub elapsed: Duration,
    pub error: Option<Error>,
}

#[derive(Debug, Default)]
pub struct DelResponse {
    pub num: usize,
    pub elapsed: Duration,
    pub error: Option<Error>,
}

#[derive(Debug, Default)]
pub struct PingResponse {
    pub elapsed: Duration,
    pub error: Option<Error>,
}

/// The discriminated response union carried back over the wire.
#[derive(Debug)]
pub enum Response {
    Get(GetResponse),
    Put(PutResponse),
    Update(UpdateResponse),
    Del(DelResponse),
    Ping(PingResponse),
}

impl Response {
    pub fn error(&self) -> Option<&Error> {
        match self {
            Response::Get(r) => r.error.as_ref(),
            Response::Put(r) => r.error.as_ref(),
            Response::Update(r) => r.error.as_ref(),
            Response::Del(r) => r.error.as_ref(),
            Response::Ping(r) => r.error.as_ref(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            Response::Get(r) => r.elapsed,
            Response::Put(r) => r.elapsed,
            Response::Update(r) => r.elapsed,
            Response::Del(r) => r.elapsed,
            Response::Ping(r) => r.elapsed,
        }
    }
}
