use std::borrow::Cow;
use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use crossterm::style::Stylize;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use podtail_types::Event;

use crate::theme::Theme;

/// How events are rendered
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    /// `namespace/pod[container]: line`
    #[default]
    Default,
    /// The line only
    Raw,
    /// One JSON object per line
    Json,
    /// Indented JSON objects
    JsonPretty,
}

impl OutputFormat {
    pub const NAMES: [&'static str; 4] = ["default", "raw", "json", "json-pretty"];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Raw => "raw",
            Self::Json => "json",
            Self::JsonPretty => "json-pretty",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "raw" => Ok(Self::Raw),
            "json" => Ok(Self::Json),
            "json-pretty" => Ok(Self::JsonPretty),
            other => Err(format!(
                "unknown output '{other}', expected one of: {}",
                Self::NAMES.join(", ")
            )),
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum Message<'a> {
    Json(Value),
    Text(Cow<'a, str>),
}

#[derive(Serialize)]
struct Record<'a> {
    namespace: &'a str,
    name: &'a str,
    container: &'a str,
    node: &'a str,
    message: Message<'a>,
}

impl<'a> Record<'a> {
    fn new(event: &'a Event) -> Self {
        let source = event.source();
        // Only JSON objects are embedded; anything else stays a string.
        let message = match event.log_json() {
            Some(value @ Value::Object(_)) => Message::Json(value),
            _ => Message::Text(event.log_lossy()),
        };
        Self {
            namespace: source.namespace(),
            name: source.name(),
            container: source.container(),
            node: source.node(),
            message,
        }
    }
}

/// Renders events to an output stream in one [`OutputFormat`]
pub struct Writer<W> {
    out: W,
    format: OutputFormat,
    color: bool,
}

impl<W: Write> Writer<W> {
    pub fn new(out: W, format: OutputFormat, color: bool) -> Self {
        Self { out, format, color }
    }

    pub fn write(&mut self, event: &Event) -> io::Result<()> {
        match self.format {
            OutputFormat::Default => {
                let prefix = format!("{}: ", event.source());
                if self.color {
                    let color = Theme::prefix(event.source());
                    write!(self.out, "{}", prefix.with(color).bold())?;
                } else {
                    self.out.write_all(prefix.as_bytes())?;
                }
                self.out.write_all(event.log())?;
            }
            OutputFormat::Raw => {
                self.out.write_all(event.log())?;
            }
            OutputFormat::Json => {
                serde_json::to_writer(&mut self.out, &Record::new(event))?;
            }
            OutputFormat::JsonPretty => {
                serde_json::to_writer_pretty(&mut self.out, &Record::new(event))?;
            }
        }
        self.out.write_all(b"\n")
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
