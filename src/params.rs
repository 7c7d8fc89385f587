use crate::cache::QueryCache;
use crate::error::CacheError;
use crate::ordering::QueryId;
use crate::query::{Datum, GlobalOptargs, RawTerm};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Start,
    Continue,
    Stop,
    NoreplyWait,
    ServerInfo,
}

impl QueryType {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(QueryType::Start),
            2 => Some(QueryType::Continue),
            3 => Some(QueryType::Stop),
            4 => Some(QueryType::NoreplyWait),
            5 => Some(QueryType::ServerInfo),
            _ => None,
        }
    }
}

/// One decoded request against a connection's query cache. Holds the
/// request's submission slot until it is released by the cache.
#[derive(Debug)]
pub struct QueryParams {
    cache_id: u64,
    token: i64,
    query_type: QueryType,
    root_term: Option<RawTerm>,
    global_optargs: GlobalOptargs,
    noreply: bool,
    profile: bool,
    id: u64,
    query_id: Option<QueryId>,
}

impl QueryParams {
    pub fn new(cache: &QueryCache, token: i64, query_type: QueryType) -> Self {
        let query_id = cache.submission_order().issue();
        Self {
            cache_id: cache.id(),
            token,
            query_type,
            root_term: None,
            global_optargs: GlobalOptargs::default(),
            noreply: false,
            profile: false,
            id: query_id.value(),
            query_id: Some(query_id),
        }
    }

    /// Decodes `[type, term?, optargs?]`. `noreply` and `profile` are read
    /// from the optargs.
    pub fn from_json(cache: &QueryCache, token: i64, query: &Datum) -> Result<Self, CacheError> {
        let Some(parts) = query.as_array() else {
            return Err(CacheError::client(format!(
                "Expected a query to be an array, but found {}.",
                datum_type_name(query)
            )));
        };
        if parts.is_empty() || parts.len() > 3 {
            return Err(CacheError::client(format!(
                "Expected 1 to 3 query elements, but found {}.",
                parts.len()
            )));
        }
        let query_type = parts[0]
            .as_u64()
            .and_then(QueryType::from_code)
            .ok_or_else(|| CacheError::client(format!("Unexpected query type: {}.", parts[0])))?;

        let mut params = Self::new(cache, token, query_type);
        if let Some(term) = parts.get(1) {
            params.root_term = Some(term.clone());
        }
        if let Some(optargs) = parts.get(2) {
            let Some(map) = optargs.as_object() else {
                return Err(CacheError::client(format!(
                    "Expected global optargs to be an object, but found {}.",
                    datum_type_name(optargs)
                )));
            };
            params = params.with_global_optargs(map.clone())?;
        }
        if query_type == QueryType::Start && params.root_term.is_none() {
            return Err(CacheError::client("Expected a query term for START."));
        }
        Ok(params)
    }

    pub fn with_term(mut self, term: RawTerm) -> Self {
        self.root_term = Some(term);
        self
    }

    pub fn with_global_optargs(
        mut self,
        optargs: serde_json::Map<String, Datum>,
    ) -> Result<Self, CacheError> {
        self.noreply = bool_optarg(&optargs, "noreply")?.unwrap_or(self.noreply);
        self.profile = bool_optarg(&optargs, "profile")?.unwrap_or(self.profile);
        self.global_optargs = GlobalOptargs::new(optargs);
        Ok(self)
    }

    pub fn with_noreply(mut self, noreply: bool) -> Self {
        self.noreply = noreply;
        self
    }

    pub fn with_profile(mut self, profile: bool) -> Self {
        self.profile = profile;
        self
    }

    pub fn token(&self) -> i64 {
        self.token
    }

    pub fn query_type(&self) -> QueryType {
        self.query_type
    }

    pub fn noreply(&self) -> bool {
        self.noreply
    }

    pub fn profile(&self) -> bool {
        self.profile
    }

    /// Submission id assigned when the request was decoded.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn cache_id(&self) -> u64 {
        self.cache_id
    }

    /// Gives up the submission slot. Later calls do nothing.
    pub fn maybe_release_query_id(&mut self) {
        self.query_id = None;
    }

    pub fn holds_query_id(&self) -> bool {
        self.query_id.is_some()
    }

    pub(crate) fn take_root_term(&mut self) -> Option<RawTerm> {
        self.root_term.take()
    }

    pub(crate) fn take_global_optargs(&mut self) -> GlobalOptargs {
        std::mem::take(&mut self.global_optargs)
    }
}

fn bool_optarg(
    optargs: &serde_json::Map<String, Datum>,
    name: &str,
) -> Result<Option<bool>, CacheError> {
    match optargs.get(name) {
        None => Ok(None),
        Some(Datum::Bool(value)) => Ok(Some(*value)),
        Some(other) => Err(CacheError::client(format!(
            "Expected `{name}` to be a BOOL, but found {}.",
            datum_type_name(other)
        ))),
    }
}

fn datum_type_name(datum: &Datum) -> &'static str {
    match datum {
        Datum::Null => "NULL",
        Datum::Bool(_) => "BOOL",
        Datum::Number(_) => "NUMBER",
        Datum::String(_) => "STRING",
        Datum::Array(_) => "ARRAY",
        Datum::Object(_) => "OBJECT",
    }
}
