use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Identifier of an IPC connection (interceptors, command sources).
pub type ConnectionId = Uuid;

// ─── Code channels ────────────────────────────────────────────

/// Logical input stream a code originates from. Every channel has its own
/// scheduler state and its own file-capture slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodeChannel {
    Http,
    Telnet,
    File,
    Usb,
    Aux,
    Daemon,
    Queue,
    Lcd,
    Sbc,
    AutoPause,
    Trigger,
}

impl CodeChannel {
    pub const COUNT: usize = 11;

    pub const ALL: [CodeChannel; Self::COUNT] = [
        CodeChannel::Http,
        CodeChannel::Telnet,
        CodeChannel::File,
        CodeChannel::Usb,
        CodeChannel::Aux,
        CodeChannel::Daemon,
        CodeChannel::Queue,
        CodeChannel::Lcd,
        CodeChannel::Sbc,
        CodeChannel::AutoPause,
        CodeChannel::Trigger,
    ];

    /// Stable index into the per-channel state arrays.
    pub fn index(self) -> usize {
        match self {
            CodeChannel::Http => 0,
            CodeChannel::Telnet => 1,
            CodeChannel::File => 2,
            CodeChannel::Usb => 3,
            CodeChannel::Aux => 4,
            CodeChannel::Daemon => 5,
            CodeChannel::Queue => 6,
            CodeChannel::Lcd => 7,
            CodeChannel::Sbc => 8,
            CodeChannel::AutoPause => 9,
            CodeChannel::Trigger => 10,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CodeChannel::Http => "HTTP",
            CodeChannel::Telnet => "Telnet",
            CodeChannel::File => "File",
            CodeChannel::Usb => "USB",
            CodeChannel::Aux => "Aux",
            CodeChannel::Daemon => "Daemon",
            CodeChannel::Queue => "Queue",
            CodeChannel::Lcd => "LCD",
            CodeChannel::Sbc => "SBC",
            CodeChannel::AutoPause => "AutoPause",
            CodeChannel::Trigger => "Trigger",
        }
    }
}

impl std::fmt::Display for CodeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ─── Priority classes ─────────────────────────────────────────

/// Priority class a code is admitted under. Higher classes overtake lower
/// ones at admission time; within a class no overtaking is permitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InternalCodeType {
    Regular = 0,
    Acknowledgement = 1,
    Macro = 2,
    Prioritized = 3,
}

impl InternalCodeType {
    pub const COUNT: usize = 4;

    pub fn index(self) -> usize {
        self as usize
    }
}

// ─── Code flags ───────────────────────────────────────────────

bitflags! {
    /// Execution flags of a code. Monotonic over the code's lifetime except
    /// where the pipeline explicitly adds them. Serde support comes from the
    /// bitflags serde feature.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct CodeFlags: u16 {
        /// Fire-and-forget; the caller receives no result.
        const ASYNCHRONOUS = 1 << 0;
        /// Emitted from a macro file.
        const IS_FROM_MACRO = 1 << 1;
        /// Admit under the Prioritized class.
        const IS_PRIORITIZED = 1 << 2;
        /// Forbid pipelining; the start lock is held until the reply arrives.
        const UNBUFFERED = 1 << 3;
        /// Pre-interception has run.
        const IS_PRE_PROCESSED = 1 << 4;
        /// Post-interception has run.
        const IS_POST_PROCESSED = 1 << 5;
        /// Resolved locally; the firmware dispatcher has not been invoked.
        const IS_INTERNALLY_PROCESSED = 1 << 6;
        /// An interceptor supplied the result.
        const RESOLVED_BY_INTERCEPTOR = 1 << 7;
    }
}

// ─── Code type & keywords ─────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeType {
    GCode,
    MCode,
    TCode,
    Comment,
    Keyword,
}

/// Meta keywords recognized at the start of a line. Only `echo` is evaluated
/// by the execution core; the conditional keywords are consumed by file
/// stream processing before a code reaches the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeywordType {
    Echo,
    If,
    ElseIf,
    Else,
    While,
    Break,
    Continue,
    Var,
    Set,
    Abort,
}

impl KeywordType {
    /// Maps a lower-case word to a keyword, if it is one.
    pub fn from_word(word: &str) -> Option<KeywordType> {
        match word {
            "echo" => Some(KeywordType::Echo),
            "if" => Some(KeywordType::If),
            "elif" => Some(KeywordType::ElseIf),
            "else" => Some(KeywordType::Else),
            "while" => Some(KeywordType::While),
            "break" => Some(KeywordType::Break),
            "continue" => Some(KeywordType::Continue),
            "var" => Some(KeywordType::Var),
            "set" => Some(KeywordType::Set),
            "abort" => Some(KeywordType::Abort),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KeywordType::Echo => "echo",
            KeywordType::If => "if",
            KeywordType::ElseIf => "elif",
            KeywordType::Else => "else",
            KeywordType::While => "while",
            KeywordType::Break => "break",
            KeywordType::Continue => "continue",
            KeywordType::Var => "var",
            KeywordType::Set => "set",
            KeywordType::Abort => "abort",
        }
    }
}

// ─── Compatibility modes ──────────────────────────────────────

/// Per-channel emulation of another firmware's textual framing. Affects the
/// M20 listing format and the `ok` terminators applied after execution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compatibility {
    #[default]
    Me,
    RepRapFirmware,
    Marlin,
    NanoDlp,
    Teacup,
    Sprinter,
    Repetier,
}

impl Compatibility {
    /// Modes that expect Marlin-style `ok` acknowledgements.
    pub fn wants_ok(self) -> bool {
        matches!(self, Compatibility::Marlin | Compatibility::NanoDlp)
    }

    pub fn from_value(value: i32) -> Option<Compatibility> {
        match value {
            0 => Some(Compatibility::Me),
            1 => Some(Compatibility::RepRapFirmware),
            2 => Some(Compatibility::Marlin),
            3 => Some(Compatibility::Teacup),
            4 => Some(Compatibility::Sprinter),
            5 => Some(Compatibility::Repetier),
            6 => Some(Compatibility::NanoDlp),
            _ => None,
        }
    }
}

// ─── Messages & results ───────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Success,
    Warning,
    Error,
}

/// One line of output produced by executing a code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub mtype: MessageType,
    pub content: String,
}

impl Message {
    pub fn success(content: impl Into<String>) -> Message {
        Message {
            mtype: MessageType::Success,
            content: content.into(),
        }
    }

    pub fn warning(content: impl Into<String>) -> Message {
        Message {
            mtype: MessageType::Warning,
            content: content.into(),
        }
    }

    pub fn error(content: impl Into<String>) -> Message {
        Message {
            mtype: MessageType::Error,
            content: content.into(),
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.mtype {
            MessageType::Success => f.write_str(&self.content),
            MessageType::Warning => write!(f, "Warning: {}", self.content),
            MessageType::Error => write!(f, "Error: {}", self.content),
        }
    }
}

/// Ordered list of messages produced by one code. An empty result is
/// distinguishable from no result at all (`Option<CodeResult>` is `None`
/// when no content was produced, e.g. after cancellation).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeResult(pub Vec<Message>);

impl CodeResult {
    pub fn new() -> CodeResult {
        CodeResult(Vec::new())
    }

    /// True iff no message is of Error type.
    pub fn is_successful(&self) -> bool {
        self.0.iter().all(|m| m.mtype != MessageType::Error)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, message: Message) {
        self.0.push(message);
    }
}

impl From<Message> for CodeResult {
    fn from(message: Message) -> CodeResult {
        CodeResult(vec![message])
    }
}

impl std::fmt::Display for CodeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for message in &self.0 {
            if !first {
                f.write_str("\n")?;
            }
            write!(f, "{message}")?;
            first = false;
        }
        Ok(())
    }
}

// ─── Macro handle ─────────────────────────────────────────────

/// Index into the macro arena. Codes carry the index, never an owning
/// pointer, so that macro → code → macro cycles cannot form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacroHandle(pub(crate) usize);

impl MacroHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_indices_are_dense_and_stable() {
        for (i, channel) in CodeChannel::ALL.iter().enumerate() {
            assert_eq!(channel.index(), i);
        }
    }

    #[test]
    fn priority_classes_are_ordered() {
        assert!(InternalCodeType::Regular < InternalCodeType::Acknowledgement);
        assert!(InternalCodeType::Acknowledgement < InternalCodeType::Macro);
        assert!(InternalCodeType::Macro < InternalCodeType::Prioritized);
    }

    #[test]
    fn result_success_depends_on_error_messages() {
        let mut result = CodeResult::new();
        assert!(result.is_successful());
        result.push(Message::warning("bed not probed"));
        assert!(result.is_successful());
        result.push(Message::error("out of range"));
        assert!(!result.is_successful());
    }

    #[test]
    fn message_display_prefixes_severity() {
        assert_eq!(Message::success("done").to_string(), "done");
        assert_eq!(Message::warning("hot").to_string(), "Warning: hot");
        assert_eq!(Message::error("bad").to_string(), "Error: bad");
    }
}
