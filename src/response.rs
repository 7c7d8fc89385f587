use crate::error::CacheError;
use crate::query::Datum;
use crate::query::backtrace::Backtrace;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseType {
    SuccessAtom,
    SuccessSequence,
    SuccessPartial,
    WaitComplete,
    ClientError,
    CompileError,
    RuntimeError,
}

impl ResponseType {
    /// Numeric code used on the wire.
    pub fn code(self) -> u32 {
        match self {
            ResponseType::SuccessAtom => 1,
            ResponseType::SuccessSequence => 2,
            ResponseType::SuccessPartial => 3,
            ResponseType::WaitComplete => 4,
            ResponseType::ClientError => 16,
            ResponseType::CompileError => 17,
            ResponseType::RuntimeError => 18,
        }
    }

    pub fn is_error(self) -> bool {
        matches!(
            self,
            ResponseType::ClientError | ResponseType::CompileError | ResponseType::RuntimeError
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseNote {
    SequenceFeed,
    AtomFeed,
    OrderByLimitFeed,
    UnionedFeed,
    IncludesStates,
}

impl ResponseNote {
    pub fn code(self) -> u32 {
        match self {
            ResponseNote::SequenceFeed => 1,
            ResponseNote::AtomFeed => 2,
            ResponseNote::OrderByLimitFeed => 3,
            ResponseNote::UnionedFeed => 4,
            ResponseNote::IncludesStates => 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Response {
    #[serde(rename = "type")]
    response_type: Option<ResponseType>,
    data: Vec<Datum>,
    #[serde(skip_serializing_if = "Option::is_none")]
    backtrace: Option<Backtrace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    profile: Option<Datum>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    notes: Vec<ResponseNote>,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait_complete() -> Self {
        Self {
            response_type: Some(ResponseType::WaitComplete),
            ..Self::default()
        }
    }

    /// Builds the response a fault is reported with. Interruptions and
    /// configuration errors are not client-visible and yield `None`.
    pub fn from_error(err: &CacheError) -> Option<Self> {
        let response_type = err.response_type()?;
        Some(Self {
            response_type: Some(response_type),
            data: vec![Datum::String(err.to_string())],
            backtrace: Some(err.backtrace().cloned().unwrap_or_default()),
            profile: None,
            notes: Vec::new(),
        })
    }

    pub fn response_type(&self) -> Option<ResponseType> {
        self.response_type
    }

    pub fn set_type(&mut self, response_type: ResponseType) {
        self.response_type = Some(response_type);
    }

    /// `true` once the client should not expect more data for this token.
    pub fn is_final(&self) -> bool {
        !matches!(self.response_type, Some(ResponseType::SuccessPartial) | None)
    }

    pub fn data(&self) -> &[Datum] {
        &self.data
    }

    pub fn set_data(&mut self, datum: Datum) {
        self.data = vec![datum];
    }

    pub fn set_batch(&mut self, batch: Vec<Datum>) {
        self.data = batch;
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_ref()
    }

    pub fn profile(&self) -> Option<&Datum> {
        self.profile.as_ref()
    }

    pub fn set_profile(&mut self, profile: Datum) {
        self.profile = Some(profile);
    }

    pub fn notes(&self) -> &[ResponseNote] {
        &self.notes
    }

    pub fn add_note(&mut self, note: ResponseNote) {
        if !self.notes.contains(&note) {
            self.notes.push(note);
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
