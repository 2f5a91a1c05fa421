//! Count- and time-bounded windowing over a continuous feed.
//!
//! [`WindowAggregator`] is a pure state machine driven by explicit instants;
//! [`run_window`] feeds it from a channel and arms the runtime timer for the
//! open window's deadline.

use crate::channel::{ChannelConsumer, ChannelProducer};
use crate::error::{PipelineError, Result};
use crate::item::Item;
use crate::stage::{Pulled, StageContext};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Window bounds: closed by whichever of count or span is reached first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    /// Count bound `C`
    pub max_items: usize,
    /// Time bound `T`, measured from the first item of the window.
    /// A span too large to add to an instant leaves windows count-bound only.
    pub max_span: Duration,
}

impl WindowConfig {
    pub fn new(max_items: usize, max_span: Duration) -> Self {
        Self {
            max_items,
            max_span,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_items == 0 {
            return Err(PipelineError::Config("window max_items must be at least 1".into()));
        }
        if self.max_span.is_zero() {
            return Err(PipelineError::Config("window max_span must be non-zero".into()));
        }
        Ok(())
    }
}

/// Why a window was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    Count,
    Time,
    /// Partial window emitted at end of stream
    Flush,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseReason::Count => "count",
            CloseReason::Time => "time",
            CloseReason::Flush => "flush",
        };
        f.write_str(name)
    }
}

/// A closed, immutable batch of items
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window<T> {
    index: u64,
    items: Vec<Item<T>>,
    opened_at: Instant,
    closed_at: Instant,
    reason: CloseReason,
}

impl<T> Window<T> {
    /// Position of this window in the output sequence
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn items(&self) -> &[Item<T>] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn closed_at(&self) -> Instant {
        self.closed_at
    }

    /// Time between the first item and the close
    pub fn span(&self) -> Duration {
        self.closed_at.saturating_duration_since(self.opened_at)
    }

    pub fn reason(&self) -> CloseReason {
        self.reason
    }

    /// Sequence numbers of the items, in arrival order
    pub fn sequences(&self) -> Vec<u64> {
        self.items.iter().map(Item::seq).collect()
    }

    pub fn payloads(&self) -> impl Iterator<Item = &T> {
        self.items.iter().map(Item::payload)
    }

    pub fn into_items(self) -> Vec<Item<T>> {
        self.items
    }
}

/// Observable aggregator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Idle,
    Accumulating,
    Done,
}

#[derive(Debug)]
struct OpenWindow<T> {
    items: Vec<Item<T>>,
    opened_at: Instant,
    /// `None` when the span does not fit in an `Instant`
    deadline: Option<Instant>,
}

/// Count/time window state machine.
///
/// `Idle → Accumulating → Idle`, ending in `Done` after [`finish`](Self::finish).
#[derive(Debug)]
pub struct WindowAggregator<T> {
    config: WindowConfig,
    open: Option<OpenWindow<T>>,
    next_index: u64,
    done: bool,
}

impl<T> WindowAggregator<T> {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            config,
            open: None,
            next_index: 0,
            done: false,
        }
    }

    pub fn state(&self) -> WindowState {
        if self.done {
            WindowState::Done
        } else if self.open.is_some() {
            WindowState::Accumulating
        } else {
            WindowState::Idle
        }
    }

    /// When the open window's time bound fires
    pub fn deadline(&self) -> Option<Instant> {
        self.open.as_ref().and_then(|w| w.deadline)
    }

    /// Items in the open window
    pub fn pending(&self) -> usize {
        self.open.as_ref().map_or(0, |w| w.items.len())
    }

    /// Add an item arriving at `now`; returns every window this closes.
    ///
    /// An item arriving exactly at the deadline that completes the count
    /// joins the window (count wins the tie). Any other item at or past the
    /// deadline first closes the expired window by time, then opens the next
    /// one, so no window spans more than `max_span`.
    pub fn push(&mut self, item: Item<T>, now: Instant) -> Vec<Window<T>> {
        let mut closed = Vec::new();
        if self.done {
            return closed;
        }

        let max_items = self.config.max_items;
        let expired = self.deadline().filter(|&deadline| {
            now > deadline || (now == deadline && self.pending() + 1 < max_items)
        });
        if let Some(deadline) = expired {
            closed.extend(self.close(deadline, CloseReason::Time));
        }

        let max_span = self.config.max_span;
        let open = self.open.get_or_insert_with(|| OpenWindow {
            items: Vec::new(),
            opened_at: now,
            deadline: now.checked_add(max_span),
        });
        open.items.push(item);

        if open.items.len() >= self.config.max_items {
            closed.extend(self.close(now, CloseReason::Count));
        }
        closed
    }

    /// Close the open window if its deadline has been reached
    pub fn on_timer(&mut self, now: Instant) -> Option<Window<T>> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        self.close(deadline, CloseReason::Time)
    }

    /// Flush the partial window at end of stream and stop.
    ///
    /// A window whose deadline already passed closes by time instead.
    pub fn finish(&mut self, now: Instant) -> Option<Window<T>> {
        let flushed = match self.deadline() {
            Some(deadline) if now >= deadline => self.close(deadline, CloseReason::Time),
            _ => self.close(now, CloseReason::Flush),
        };
        self.done = true;
        flushed
    }

    fn close(&mut self, at: Instant, reason: CloseReason) -> Option<Window<T>> {
        let open = self.open.take()?;
        let index = self.next_index;
        self.next_index += 1;
        Some(Window {
            index,
            items: open.items,
            opened_at: open.opened_at,
            closed_at: at,
            reason,
        })
    }
}

/// Drive an aggregator between two channels.
///
/// Upstream completion flushes the partial window; an upstream failure drops
/// it and forwards the error.
pub(crate) async fn run_window<T: Send + 'static>(
    input: ChannelConsumer<T>,
    output: ChannelProducer<Window<T>>,
    ctx: StageContext,
    config: WindowConfig,
) {
    let mut aggregator = WindowAggregator::new(config);

    loop {
        let deadline = aggregator.deadline();
        let closed = tokio::select! {
            biased;
            () = ctx.cancel_token().cancelled() => return ctx.stop(&input),
            pulled = ctx.pull(&input, &output) => match pulled {
                Pulled::Item(item) => aggregator.push(item, Instant::now()),
                Pulled::End => {
                    if let Some(window) = aggregator.finish(Instant::now()) {
                        if !emit_window(&ctx, &output, window).await {
                            return ctx.stop(&input);
                        }
                    }
                    return ctx.finish(&input, &output, None);
                }
                Pulled::Failed(err) => return ctx.finish(&input, &output, Some(err)),
                Pulled::Stop => return ctx.stop(&input),
            },
            () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                aggregator.on_timer(Instant::now()).into_iter().collect()
            }
        };

        for window in closed {
            if !emit_window(&ctx, &output, window).await {
                return ctx.stop(&input);
            }
        }
    }
}

async fn emit_window<T>(
    ctx: &StageContext,
    output: &ChannelProducer<Window<T>>,
    window: Window<T>,
) -> bool {
    debug!(
        pipeline = %ctx.pipeline(),
        stage = %ctx.name(),
        window = window.index(),
        size = window.len(),
        reason = %window.reason(),
        span_ms = window.span().as_millis() as u64,
        "window closed"
    );
    let index = window.index();
    ctx.emit(output, Item::new(index, window)).await
}
