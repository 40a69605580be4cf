//! Log line formatting.
//!
//! One formatter for all agent output, shaped for grepping a busy host log:
//! the level leads (fixed width, so lines align), then the emitting module,
//! then the active span scope as a dotted path with its fields in brackets,
//! then the message:
//!
//! ```text
//! INFO  trace_agent::agent: trace agent running
//! ERROR trace_agent::watchdog: exceeded max memory (current=.., max=..)
//! DEBUG trace_agent::stats::concentrator: flush[buckets=3]: concentrator flushed 3 buckets
//! ```

use std::fmt;

use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;

/// Event formatter: `LEVEL target: scope.path[fields]: message`.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        write!(writer, "{:<5} {}: ", meta.level(), meta.target())?;

        // Active spans render as a dotted path, outermost first. Each span's
        // fields ride along in brackets so one line carries the whole
        // context.
        let mut depth = 0;
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                if depth > 0 {
                    write!(writer, ".")?;
                }
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                match ext.get::<FormattedFields<N>>() {
                    Some(fields) if !fields.is_empty() => write!(writer, "[{fields}]")?,
                    _ => {}
                }
                depth += 1;
            }
        }
        if depth > 0 {
            write!(writer, ": ")?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
