use crate::mir::ValueId;
use std::fmt;

pub type RR<T> = Result<T, RangeException>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeCode {
    E1001,   // Malformed IR
    E3001,   // Range assertion failed
    E4001,   // Bound arena exhausted
    E4002,   // Fixed point not reached
    ICE9001, // Internal invariant
}

impl RangeCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::E1001 => "E1001",
            Self::E3001 => "E3001",
            Self::E4001 => "E4001",
            Self::E4002 => "E4002",
            Self::ICE9001 => "ICE9001",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Verify,
    Beta,
    Analyze,
    Assert,
    Truncate,
    Eval,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub name: String,
    pub value: Option<ValueId>,
}

#[derive(Debug, Clone)]
pub struct RangeException {
    pub module: &'static str,
    pub message: String,
    pub code: RangeCode,
    pub stage: Stage,
    pub value: Option<ValueId>,
    pub stacktrace: Vec<Frame>,
    pub notes: Vec<String>,
}

impl RangeException {
    pub fn new(
        module: &'static str,
        code: RangeCode,
        stage: Stage,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            module,
            message: msg.into(),
            code,
            stage,
            value: None,
            stacktrace: Vec::new(),
            notes: Vec::new(),
        }
    }

    pub fn at_value(mut self, vid: ValueId) -> Self {
        self.value = Some(vid);
        self
    }

    pub fn push_frame(mut self, name: impl Into<String>, value: Option<ValueId>) -> Self {
        self.stacktrace.push(Frame {
            name: name.into(),
            value,
        });
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn stage_name(&self) -> &'static str {
        match self.stage {
            Stage::Verify => "Verify",
            Stage::Beta => "Beta",
            Stage::Analyze => "Analyze",
            Stage::Assert => "Assert",
            Stage::Truncate => "Truncate",
            Stage::Eval => "Eval",
        }
    }

    pub fn render(&self, function: Option<&str>, color: bool) -> String {
        let mut out = String::new();
        self.render_into(&mut out, function.unwrap_or("<fn>"), color);
        out
    }

    fn render_into(&self, out: &mut String, function: &str, color: bool) {
        let palette = palette_for_module(self.module);
        let code_color = palette_for_code(self.code.as_str(), palette.code);
        let at = match self.value {
            Some(v) => format!("{} v{}", function, v),
            None => function.to_string(),
        };
        push_line(
            out,
            style(color, palette.header, &format!("** ({}) {}", self.module, self.message)),
        );
        push_line(
            out,
            style(
                color,
                code_color,
                &format!("    error[{}]: {}", self.code.as_str(), self.message),
            ),
        );
        push_line(
            out,
            style(color, palette.at, &format!("    at {} ({})", at, self.stage_name())),
        );

        if !self.stacktrace.is_empty() {
            push_line(out, style(color, "1;95", "    stacktrace:"));
            for frame in self.stacktrace.iter().rev() {
                let line = match frame.value {
                    Some(v) => format!("      (pass) {} at v{}", frame.name, v),
                    None => format!("      (pass) {}", frame.name),
                };
                push_line(out, style(color, "2", &line));
            }
        }
        for n in &self.notes {
            push_line(out, style(color, palette.hint, &format!("hint: {}", n)));
        }
    }
}

impl fmt::Display for RangeException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "error[{}]: {} ({})",
            self.code.as_str(),
            self.message,
            self.stage_name()
        )
    }
}

impl std::error::Error for RangeException {}

fn push_line(out: &mut String, line: String) {
    out.push_str(&line);
    out.push('\n');
}

struct ErrorPalette {
    header: &'static str,
    code: &'static str,
    at: &'static str,
    hint: &'static str,
}

fn palette_for_module(module: &str) -> ErrorPalette {
    if module.contains("VerifyError") {
        ErrorPalette {
            header: "1;93",
            code: "1;33",
            at: "1;96",
            hint: "1;92",
        }
    } else if module.contains("AssertionError") {
        ErrorPalette {
            header: "1;91",
            code: "1;31",
            at: "1;96",
            hint: "1;92",
        }
    } else if module.contains("InternalError") || module.contains("ICE") {
        ErrorPalette {
            header: "1;97;41",
            code: "1;97;41",
            at: "1;96",
            hint: "1;92",
        }
    } else {
        ErrorPalette {
            header: "1;96",
            code: "1;36",
            at: "1;96",
            hint: "1;92",
        }
    }
}

fn palette_for_code<'a>(code: &'a str, fallback: &'a str) -> &'a str {
    if code.starts_with("ICE") {
        "1;97;41"
    } else if code.starts_with("E1") {
        "1;33"
    } else if code.starts_with("E3") {
        "1;31"
    } else {
        fallback
    }
}

fn style(color: bool, code: &str, text: &str) -> String {
    if color {
        format!("\x1b[{}m{}\x1b[0m", code, text)
    } else {
        text.to_string()
    }
}

#[macro_export]
macro_rules! bail {
    ($mod:expr, $code:expr, $stage:expr, $($arg:tt)*) => {
        return Err($crate::error::RangeException::new($mod, $code, $stage, format!($($arg)*)))
    };
}

#[macro_export]
macro_rules! ensure {
    ($cond:expr, $mod:expr, $code:expr, $stage:expr, $($arg:tt)*) => {
        if !($cond) {
            return Err($crate::error::RangeException::new($mod, $code, $stage, format!($($arg)*)))
        }
    };
}

#[macro_export]
macro_rules! bail_at {
    ($vid:expr, $mod:expr, $code:expr, $stage:expr, $($arg:tt)*) => {
        return Err($crate::error::RangeException::new($mod, $code, $stage, format!($($arg)*)).at_value($vid))
    };
}

#[macro_export]
macro_rules! ensure_at {
    ($cond:expr, $vid:expr, $mod:expr, $code:expr, $stage:expr, $($arg:tt)*) => {
        if !($cond) {
            return Err($crate::error::RangeException::new($mod, $code, $stage, format!($($arg)*)).at_value($vid))
        }
    };
}

pub trait RangeCtx<T> {
    fn ctx(self, name: &'static str, value: Option<ValueId>) -> RR<T>;
}

impl<T> RangeCtx<T> for RR<T> {
    fn ctx(self, name: &'static str, value: Option<ValueId>) -> RR<T> {
        self.map_err(|e| e.push_frame(name, value))
    }
}
