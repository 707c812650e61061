//! Terminal dashboard for watching the fridge.

use anyhow::Result;
use cryolab::fridge::Fridge;
use cryolab::transport::Transport;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::{Backend, CrosstermBackend};
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::symbols;
use ratatui::text::{Line, Span};
use ratatui::widgets::{Axis, Block, Borders, Chart, Dataset, GraphType, Paragraph};
use ratatui::{Frame, Terminal};
use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

/// One gauge as last read.
#[derive(Debug, Clone, PartialEq)]
pub struct GaugeReading {
    pub channel: u8,
    pub value: f64,
    pub limit: f64,
}

impl GaugeReading {
    pub fn ok(&self) -> bool {
        self.value < self.limit
    }
}

/// What the dashboard shows.
#[derive(Debug, Clone)]
pub struct MonitorState {
    /// (seconds since start, mK), oldest first.
    pub history: VecDeque<(f64, f64)>,
    pub capacity: usize,
    pub gauges: Vec<GaugeReading>,
    pub status: String,
    pub last_error: Option<String>,
}

impl MonitorState {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity: capacity.max(2),
            gauges: Vec::new(),
            status: String::new(),
            last_error: None,
        }
    }

    pub fn record(&mut self, elapsed_s: f64, temperature_mk: f64) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back((elapsed_s, temperature_mk));
    }

    pub fn latest(&self) -> Option<f64> {
        self.history.back().map(|&(_, t)| t)
    }

    /// Time axis bounds covering the history.
    pub fn x_bounds(&self) -> [f64; 2] {
        match (self.history.front(), self.history.back()) {
            (Some(&(first, _)), Some(&(last, _))) if last > first => [first, last],
            (Some(&(first, _)), _) => [first, first + 1.0],
            _ => [0.0, 1.0],
        }
    }

    /// Temperature axis bounds with a 5% margin.
    pub fn y_bounds(&self) -> [f64; 2] {
        let (lo, hi) = self
            .history
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &(_, t)| {
                (lo.min(t), hi.max(t))
            });
        if !lo.is_finite() {
            return [0.0, 1.0];
        }
        let margin = ((hi - lo) * 0.05).max(0.5);
        [lo - margin, hi + margin]
    }

    /// Read everything once. Errors end up on screen rather than ending the
    /// dashboard.
    pub fn poll<T: Transport>(&mut self, fridge: &mut Fridge<T>, elapsed_s: f64) {
        self.last_error = None;
        match fridge.temperature_mk() {
            Ok(t) => self.record(elapsed_s, t),
            Err(err) => self.last_error = Some(err.to_string()),
        }
        let limits = fridge.settings().pressure_limits.clone();
        let mut gauges = Vec::with_capacity(limits.len());
        for limit in limits {
            match fridge.read_sensor(limit.channel) {
                Ok(value) => gauges.push(GaugeReading {
                    channel: limit.channel,
                    value,
                    limit: limit.below,
                }),
                Err(err) => self.last_error = Some(err.to_string()),
            }
        }
        self.gauges = gauges;
        match fridge.status() {
            Ok(status) => self.status = status,
            Err(err) => self.last_error = Some(err.to_string()),
        }
    }
}

/// Draw the dashboard.
pub fn render(frame: &mut Frame<'_>, state: &MonitorState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(8), Constraint::Length(state.gauges.len() as u16 + 4)])
        .split(frame.size());

    let points: Vec<(f64, f64)> = state.history.iter().copied().collect();
    let [x_lo, x_hi] = state.x_bounds();
    let [y_lo, y_hi] = state.y_bounds();
    let dataset = Dataset::default()
        .name("mixing chamber")
        .marker(symbols::Marker::Braille)
        .graph_type(GraphType::Line)
        .style(Style::default().fg(Color::Cyan))
        .data(&points);
    let title = match state.latest() {
        Some(t) => format!(" Temperature {t:.1} mK "),
        None => String::from(" Temperature "),
    };
    let chart = Chart::new(vec![dataset])
        .block(Block::default().title(title).borders(Borders::ALL))
        .x_axis(
            Axis::default()
                .title("s")
                .bounds([x_lo, x_hi])
                .labels(vec![
                    Span::raw(format!("{x_lo:.0}")),
                    Span::raw(format!("{x_hi:.0}")),
                ]),
        )
        .y_axis(
            Axis::default()
                .title("mK")
                .bounds([y_lo, y_hi])
                .labels(vec![
                    Span::raw(format!("{y_lo:.1}")),
                    Span::raw(format!("{y_hi:.1}")),
                ]),
        );
    frame.render_widget(chart, chunks[0]);

    let mut lines: Vec<Line> = state
        .gauges
        .iter()
        .map(|g| {
            let style = if g.ok() {
                Style::default().fg(Color::Green)
            } else {
                Style::default().fg(Color::Red).add_modifier(Modifier::BOLD)
            };
            Line::from(vec![
                Span::raw(format!("P{:<3}", g.channel)),
                Span::styled(format!("{:>10.0}", g.value), style),
                Span::raw(format!("  (limit {:.0})", g.limit)),
            ])
        })
        .collect();
    lines.push(Line::from(format!("Status {}", state.status)));
    if let Some(err) = &state.last_error {
        lines.push(Line::from(Span::styled(
            format!("Error: {err}"),
            Style::default().fg(Color::Red),
        )));
    }
    let panel = Paragraph::new(lines).block(
        Block::default()
            .title(" Gauges (q to quit) ")
            .borders(Borders::ALL),
    );
    frame.render_widget(panel, chunks[1]);
}

/// Run the dashboard until `q` or Esc.
pub fn run_monitor<T: Transport>(
    fridge: &mut Fridge<T>,
    interval: Duration,
    history: usize,
) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    let result = monitor_loop(&mut terminal, fridge, interval, history);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    result
}

fn monitor_loop<B: Backend, T: Transport>(
    terminal: &mut Terminal<B>,
    fridge: &mut Fridge<T>,
    interval: Duration,
    history: usize,
) -> Result<()> {
    let start = Instant::now();
    let mut state = MonitorState::new(history);
    let mut next_poll = Instant::now();
    loop {
        if Instant::now() >= next_poll {
            state.poll(fridge, start.elapsed().as_secs_f64());
            next_poll += interval;
        }
        terminal.draw(|frame| render(frame, &state))?;

        let wait = next_poll.saturating_duration_since(Instant::now());
        if event::poll(wait)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press
                    && matches!(key.code, KeyCode::Char('q') | KeyCode::Esc)
                {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryolab::fridge::FridgeSettings;
    use cryolab::sim::{FridgeSimulator, SimTransport};
    use ratatui::backend::TestBackend;

    #[test]
    fn history_is_capped() {
        let mut state = MonitorState::new(3);
        for k in 0..5 {
            state.record(k as f64, 100.0 + k as f64);
        }
        assert_eq!(state.history.len(), 3);
        assert_eq!(state.history.front(), Some(&(2.0, 102.0)));
        assert_eq!(state.latest(), Some(104.0));
        assert_eq!(state.x_bounds(), [2.0, 4.0]);
    }

    #[test]
    fn bounds_of_empty_and_flat_history() {
        let mut state = MonitorState::new(10);
        assert_eq!(state.y_bounds(), [0.0, 1.0]);
        state.record(0.0, 50.0);
        assert_eq!(state.x_bounds(), [0.0, 1.0]);
        assert_eq!(state.y_bounds(), [49.5, 50.5]);
    }

    #[test]
    fn poll_reads_gauges_and_status() {
        let mut fridge = Fridge::new(
            SimTransport::new(FridgeSimulator::new()),
            FridgeSettings::default(),
        );
        let mut state = MonitorState::new(10);
        state.poll(&mut fridge, 0.0);
        assert_eq!(state.latest(), Some(100.0));
        assert_eq!(state.gauges.len(), 2);
        assert!(state.gauges.iter().all(GaugeReading::ok));
        assert!(state.status.starts_with('X'));
        assert!(state.last_error.is_none());
    }

    #[test]
    fn renders_temperature_and_gauges() {
        let mut state = MonitorState::new(10);
        state.record(0.0, 42.0);
        state.gauges.push(GaugeReading {
            channel: 14,
            value: 20_000.0,
            limit: 10_000.0,
        });
        let mut terminal = Terminal::new(TestBackend::new(80, 24)).unwrap();
        terminal.draw(|frame| render(frame, &state)).unwrap();
        let text: String = terminal
            .backend()
            .buffer()
            .content
            .iter()
            .map(|cell| cell.symbol())
            .collect();
        assert!(text.contains("Temperature 42.0 mK"));
        assert!(text.contains("P14"));
        assert!(text.contains("q to quit"));
    }
}
