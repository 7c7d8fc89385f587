use serde::Serialize;

/// One step from a term to one of its children: a positional argument or a
/// named optional argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum BacktraceStep {
    Index(usize),
    Key(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(usize);

impl FrameId {
    /// Engines that annotate terms in place store frames by index.
    pub fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

/// Path from the root term to the term that faulted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Backtrace(Vec<BacktraceStep>);

impl Backtrace {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn steps(&self) -> &[BacktraceStep] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_datum(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.0
                .iter()
                .map(|step| match step {
                    BacktraceStep::Index(i) => serde_json::Value::from(*i),
                    BacktraceStep::Key(k) => serde_json::Value::from(k.clone()),
                })
                .collect(),
        )
    }
}

#[derive(Debug)]
struct Frame {
    parent: Option<FrameId>,
    step: Option<BacktraceStep>,
}

/// Symbol table built while a term tree is preprocessed. Faults carry a
/// `FrameId`; the registry turns it back into a path for the client.
#[derive(Debug)]
pub struct BacktraceRegistry {
    frames: Vec<Frame>,
}

impl Default for BacktraceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BacktraceRegistry {
    pub fn new() -> Self {
        Self {
            frames: vec![Frame {
                parent: None,
                step: None,
            }],
        }
    }

    pub fn root(&self) -> FrameId {
        FrameId(0)
    }

    pub fn new_frame(&mut self, parent: FrameId, step: BacktraceStep) -> FrameId {
        let id = FrameId(self.frames.len());
        self.frames.push(Frame {
            parent: Some(parent),
            step: Some(step),
        });
        id
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.len() <= 1
    }

    /// Resolves `frame` into a root-first path. Faults without a frame, or
    /// with a frame from another registry, resolve to an empty backtrace.
    pub fn datum_backtrace(&self, frame: Option<FrameId>) -> Backtrace {
        let Some(mut current) = frame else {
            return Backtrace::empty();
        };
        if current.0 >= self.frames.len() {
            return Backtrace::empty();
        }
        let mut steps = Vec::new();
        while let Some(node) = self.frames.get(current.0) {
            if let Some(step) = &node.step {
                steps.push(step.clone());
            }
            match node.parent {
                Some(parent) => current = parent,
                None => break,
            }
        }
        steps.reverse();
        Backtrace(steps)
    }
}
