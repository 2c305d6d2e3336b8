//! Byte-level JSON structure scanner.
//!
//! The scanner keeps a stack of open containers together with string and
//! escape state, so it can be fed an arbitrary prefix of a document and
//! resumed later. It never allocates per byte and never backtracks.
//!
//! All structural characters are ASCII, and bytes of multi-byte UTF-8
//! sequences are always >= 0x80, so scanning raw bytes is safe even when a
//! fragment boundary splits a character.

use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq)]
enum ContainerKind {
    Object,
    Array,
}

#[derive(Debug, Clone)]
struct Container {
    kind: ContainerKind,
    /// Most recent key seen at this level (objects only).
    key: Option<String>,
    /// Number of values started at this level (arrays only).
    elements: usize,
    /// Next string at this level is a key (objects only).
    expect_key: bool,
    /// A value may start at this level.
    awaiting_value: bool,
    /// This array is the one addressed by the target path.
    is_target: bool,
}

impl Container {
    fn new(kind: ContainerKind, is_target: bool) -> Self {
        Self {
            kind,
            key: None,
            elements: 0,
            expect_key: kind == ContainerKind::Object,
            awaiting_value: kind == ContainerKind::Array,
            is_target,
        }
    }

    fn path_segment(&self) -> Option<String> {
        match self.kind {
            ContainerKind::Object => self.key.clone(),
            ContainerKind::Array => Some(self.elements.saturating_sub(1).to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ElementKind {
    Container,
    String,
    Scalar,
}

#[derive(Debug, Clone, Copy)]
struct OpenElement {
    start: usize,
    kind: ElementKind,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum StringRole {
    Key,
    Value,
}

/// A completed element of the target array.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementSpan {
    /// Position within the target array.
    pub index: usize,
    /// Byte range of the element in the scanned input.
    pub range: Range<usize>,
}

/// Incremental scanner over one JSON document.
#[derive(Debug, Clone)]
pub struct JsonScanner {
    /// Path segments of the target array; `None` disables element tracking.
    target: Option<Vec<String>>,
    stack: Vec<Container>,
    /// Number of bytes consumed so far.
    position: usize,
    in_string: Option<StringRole>,
    escape_next: bool,
    key_start: usize,
    root_start: Option<usize>,
    root_end: Option<usize>,
    element: Option<OpenElement>,
    target_elements: usize,
}

impl JsonScanner {
    /// Creates a scanner that reports elements of the array at `target_path`.
    ///
    /// An empty path addresses the root value.
    pub fn with_target(target_path: &str) -> Self {
        let segments = if target_path.is_empty() {
            Vec::new()
        } else {
            target_path.split('.').map(str::to_string).collect()
        };
        Self::build(Some(segments))
    }

    /// Creates a scanner that only tracks the extent of the root value.
    pub fn root_only() -> Self {
        Self::build(None)
    }

    fn build(target: Option<Vec<String>>) -> Self {
        Self {
            target,
            stack: Vec::new(),
            position: 0,
            in_string: None,
            escape_next: false,
            key_start: 0,
            root_start: None,
            root_end: None,
            element: None,
            target_elements: 0,
        }
    }

    /// Byte range of the root value once it has closed.
    pub fn root_span(&self) -> Option<Range<usize>> {
        Some(self.root_start?..self.root_end?)
    }

    pub fn is_complete(&self) -> bool {
        self.root_end.is_some()
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Scans `buffer[self.position()..]`.
    ///
    /// `buffer` must be the same growing buffer on every call; earlier bytes
    /// are only read back to decode object keys.
    pub fn scan(&mut self, buffer: &[u8]) -> Vec<ElementSpan> {
        let mut completed = Vec::new();
        while self.position < buffer.len() && self.root_end.is_none() {
            let pos = self.position;
            self.step(buffer, pos, &mut completed);
            self.position += 1;
        }
        if self.root_end.is_some() {
            self.position = buffer.len();
        }
        completed
    }

    fn step(&mut self, buffer: &[u8], pos: usize, completed: &mut Vec<ElementSpan>) {
        let byte = buffer[pos];

        if let Some(role) = self.in_string {
            if self.escape_next {
                self.escape_next = false;
            } else if byte == b'\\' {
                self.escape_next = true;
            } else if byte == b'"' {
                self.in_string = None;
                self.close_string(buffer, pos, role, completed);
            }
            return;
        }

        if self.root_start.is_none() {
            // Prose or Markdown fences before the document are skipped.
            if byte == b'{' || byte == b'[' {
                self.root_start = Some(pos);
                let kind = container_kind(byte);
                let is_target = kind == ContainerKind::Array
                    && self.target.as_ref().is_some_and(|t| t.is_empty());
                self.stack.push(Container::new(kind, is_target));
            }
            return;
        }

        match byte {
            b' ' | b'\t' | b'\n' | b'\r' => self.end_scalar(pos, completed),
            b'"' => {
                let Some(top) = self.stack.last_mut() else { return };
                if top.kind == ContainerKind::Object && top.expect_key {
                    self.in_string = Some(StringRole::Key);
                    self.key_start = pos;
                } else {
                    self.begin_value(pos, ElementKind::String);
                    self.in_string = Some(StringRole::Value);
                }
            }
            b'{' | b'[' => {
                self.begin_value(pos, ElementKind::Container);
                let kind = container_kind(byte);
                let is_target = kind == ContainerKind::Array && self.current_path_is_target();
                self.stack.push(Container::new(kind, is_target));
            }
            b'}' | b']' => {
                self.end_scalar(pos, completed);
                self.stack.pop();
                if self.stack.is_empty() {
                    self.root_end = Some(pos + 1);
                } else if self.top_is_target()
                    && let Some(open) = self.element
                    && open.kind == ElementKind::Container
                {
                    self.complete_element(open.start..pos + 1, completed);
                }
            }
            b':' => {
                if let Some(top) = self.stack.last_mut()
                    && top.kind == ContainerKind::Object
                {
                    top.expect_key = false;
                    top.awaiting_value = true;
                }
            }
            b',' => {
                self.end_scalar(pos, completed);
                if let Some(top) = self.stack.last_mut() {
                    match top.kind {
                        ContainerKind::Array => top.awaiting_value = true,
                        ContainerKind::Object => top.expect_key = true,
                    }
                }
            }
            _ => self.begin_value(pos, ElementKind::Scalar),
        }
    }

    fn begin_value(&mut self, pos: usize, kind: ElementKind) {
        let Some(top) = self.stack.last_mut() else { return };
        if !top.awaiting_value {
            return;
        }
        top.awaiting_value = false;
        if top.kind == ContainerKind::Array {
            top.elements += 1;
        }
        if top.is_target {
            self.element = Some(OpenElement { start: pos, kind });
        }
    }

    fn close_string(&mut self, buffer: &[u8], pos: usize, role: StringRole, completed: &mut Vec<ElementSpan>) {
        match role {
            StringRole::Key => {
                let raw = &buffer[self.key_start..=pos];
                let key = serde_json::from_slice::<String>(raw)
                    .unwrap_or_else(|_| String::from_utf8_lossy(&raw[1..raw.len() - 1]).into_owned());
                if let Some(top) = self.stack.last_mut() {
                    top.key = Some(key);
                    top.expect_key = false;
                }
            }
            StringRole::Value => {
                if self.top_is_target()
                    && let Some(open) = self.element
                    && open.kind == ElementKind::String
                {
                    self.complete_element(open.start..pos + 1, completed);
                }
            }
        }
    }

    fn end_scalar(&mut self, pos: usize, completed: &mut Vec<ElementSpan>) {
        if self.top_is_target()
            && let Some(open) = self.element
            && open.kind == ElementKind::Scalar
        {
            self.complete_element(open.start..pos, completed);
        }
    }

    fn complete_element(&mut self, range: Range<usize>, completed: &mut Vec<ElementSpan>) {
        self.element = None;
        completed.push(ElementSpan {
            index: self.target_elements,
            range,
        });
        self.target_elements += 1;
    }

    fn top_is_target(&self) -> bool {
        self.stack.last().is_some_and(|top| top.is_target)
    }

    /// Whether a container opened now sits exactly at the target path.
    fn current_path_is_target(&self) -> bool {
        let Some(target) = &self.target else {
            return false;
        };
        if target.len() != self.stack.len() {
            return false;
        }
        self.stack
            .iter()
            .zip(target)
            .all(|(container, segment)| container.path_segment().as_deref() == Some(segment.as_str()))
    }
}

fn container_kind(byte: u8) -> ContainerKind {
    if byte == b'{' {
        ContainerKind::Object
    } else {
        ContainerKind::Array
    }
}

/// Returns the first complete JSON object or array embedded in `text`.
pub fn first_json_entity(text: &str) -> Option<&str> {
    let mut scanner = JsonScanner::root_only();
    scanner.scan(text.as_bytes());
    scanner.root_span().map(|range| &text[range])
}
