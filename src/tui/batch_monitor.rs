//! TUI for batch probing with progress display

use crate::server::batch::{BatchEvent, BatchItem, BatchRunner, BatchSummary};
use crate::server::probe::{ProbeMode, Prober};
use crate::server::ranking::LatencyClass;
use crate::server::record::ServerKey;
use crate::Result;
use crossterm::{
    event::{
        self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyEventKind,
        KeyModifiers,
    },
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, List, ListItem, ListState, Paragraph, Wrap},
    Frame, Terminal,
};
use std::collections::VecDeque;
use std::io;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Maximum number of recent results to keep for display
const MAX_RECENT_RESULTS: usize = 100;

/// Redraw interval while a batch is running
const TICK: Duration = Duration::from_millis(50);

/// Batch monitor TUI state
pub struct BatchMonitor {
    mode: ProbeMode,
    total: usize,
    /// Number of probes started
    dispatched: usize,
    /// Number of probes finished
    checked: usize,
    good_count: usize,
    bad_count: usize,
    /// Name of the key most recently dispatched
    current: Option<String>,
    recent_good: VecDeque<BatchItem>,
    recent_bad: VecDeque<BatchItem>,
    /// Selected list (0 = good, 1 = bad)
    selected_list: usize,
    list_state: ListState,
    status_message: String,
    is_cancelling: bool,
    is_complete: bool,
    should_quit: bool,
}

impl BatchMonitor {
    pub fn new(total: usize, mode: ProbeMode) -> Self {
        let mut list_state = ListState::default();
        list_state.select(Some(0));

        Self {
            mode,
            total,
            dispatched: 0,
            checked: 0,
            good_count: 0,
            bad_count: 0,
            current: None,
            recent_good: VecDeque::new(),
            recent_bad: VecDeque::new(),
            selected_list: 0,
            list_state,
            status_message: "Starting probes... Press 'q' to stop.".to_string(),
            is_cancelling: false,
            is_complete: false,
            should_quit: false,
        }
    }

    /// Probe `keys` while showing progress; 'q' stops dispatching new probes
    pub async fn run(
        keys: &mut [ServerKey],
        prober: &Prober,
        mode: ProbeMode,
    ) -> Result<BatchSummary> {
        let mut monitor = Self::new(keys.len(), mode);

        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let runner = BatchRunner::new(prober);

        // Both futures run on this task; the UI yields between redraws.
        let (summary, ui_result) = tokio::join!(
            runner.run_with_channel(keys, mode, &cancel, tx),
            monitor.run_app(&mut terminal, rx, &cancel)
        );

        disable_raw_mode()?;
        execute!(
            terminal.backend_mut(),
            LeaveAlternateScreen,
            DisableMouseCapture
        )?;
        terminal.show_cursor()?;

        ui_result?;
        Ok(summary)
    }

    async fn run_app<B: Backend>(
        &mut self,
        terminal: &mut Terminal<B>,
        mut rx: UnboundedReceiver<BatchEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            terminal.draw(|f| self.ui(f))?;

            if event::poll(Duration::ZERO)? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        self.handle_input(key);
                    }
                }
            }

            if self.is_cancelling && !cancel.is_cancelled() {
                cancel.cancel();
            }

            loop {
                match rx.try_recv() {
                    Ok(event) => self.handle_event(event),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.finish();
                        break;
                    }
                }
            }

            if self.should_quit || (self.is_complete && self.is_cancelling) {
                break;
            }

            tokio::time::sleep(TICK).await;
        }

        Ok(())
    }

    /// Fold one batch event into the display state
    pub fn handle_event(&mut self, event: BatchEvent) {
        match event {
            BatchEvent::Dispatched(progress) => {
                self.dispatched = progress.index + 1;
                self.current = Some(progress.name);
            }
            BatchEvent::Finished(item) => {
                self.checked += 1;

                if item.result.is_success() {
                    self.good_count += 1;
                    self.recent_good.push_back(item);
                    if self.recent_good.len() > MAX_RECENT_RESULTS {
                        self.recent_good.pop_front();
                    }
                } else {
                    self.bad_count += 1;
                    self.recent_bad.push_back(item);
                    if self.recent_bad.len() > MAX_RECENT_RESULTS {
                        self.recent_bad.pop_front();
                    }
                }

                if !self.is_cancelling {
                    self.status_message = format!(
                        "Probing... {}% ({}/{}) | Working: {} | Failed: {}",
                        self.percent(),
                        self.checked,
                        self.total,
                        self.good_count,
                        self.bad_count
                    );
                }
            }
        }
    }

    fn finish(&mut self) {
        if self.is_complete {
            return;
        }
        self.is_complete = true;
        self.current = None;
        self.status_message = format!(
            "{}! Probed: {}/{} | Working: {} | Failed: {} | Press 'q' to quit",
            if self.is_cancelling { "Stopped" } else { "Complete" },
            self.checked,
            self.total,
            self.good_count,
            self.bad_count
        );
    }

    fn percent(&self) -> u16 {
        if self.total > 0 {
            (self.checked as f64 / self.total as f64 * 100.0) as u16
        } else {
            0
        }
    }

    fn handle_input(&mut self, key: KeyEvent) {
        // Raw mode delivers Ctrl-C as a key press instead of a signal
        let interrupt =
            key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL);
        let code = if interrupt { KeyCode::Esc } else { key.code };

        match code {
            KeyCode::Char('q') | KeyCode::Esc => {
                if self.is_complete {
                    self.should_quit = true;
                } else if !self.is_cancelling {
                    self.is_cancelling = true;
                    self.status_message =
                        "Stopping... waiting for running probes to finish".to_string();
                }
            }
            KeyCode::Tab => {
                self.selected_list = (self.selected_list + 1) % 2;
                self.list_state.select(Some(0));
            }
            KeyCode::Down => {
                let len = self.selected_len();
                let i = match self.list_state.selected() {
                    Some(i) if i < len.saturating_sub(1) => i + 1,
                    _ => 0,
                };
                self.list_state.select(Some(i));
            }
            KeyCode::Up => {
                let len = self.selected_len();
                let i = match self.list_state.selected() {
                    Some(0) | None => len.saturating_sub(1),
                    Some(i) => i - 1,
                };
                self.list_state.select(Some(i));
            }
            _ => {}
        }
    }

    fn selected_len(&self) -> usize {
        if self.selected_list == 0 {
            self.recent_good.len()
        } else {
            self.recent_bad.len()
        }
    }

    fn ui(&mut self, f: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .margin(1)
            .constraints([
                Constraint::Length(3), // Title
                Constraint::Length(3), // Progress bar
                Constraint::Min(0),    // Result lists
                Constraint::Length(3), // Status bar
            ])
            .split(f.size());

        let title = match &self.current {
            Some(name) => format!("Key Probe [{}] - {}", self.mode, name),
            None => format!("Key Probe [{}]", self.mode),
        };
        let title = Paragraph::new(title)
            .style(Style::default().fg(Color::Cyan))
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL));
        f.render_widget(title, chunks[0]);

        let progress = self.percent();
        let progress_label = format!(
            "{}/{} ({}%) | dispatched {}",
            self.checked, self.total, progress, self.dispatched
        );
        let gauge = Gauge::default()
            .block(Block::default().borders(Borders::ALL).title("Progress"))
            .gauge_style(Style::default().fg(Color::Green).bg(Color::Black))
            .percent(progress.min(100))
            .label(progress_label);
        f.render_widget(gauge, chunks[1]);

        let list_chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(chunks[2]);

        render_result_list(
            f,
            list_chunks[0],
            &format!("Working ({})", self.good_count),
            &self.recent_good,
            self.selected_list == 0,
            if self.selected_list == 0 {
                Some(&mut self.list_state)
            } else {
                None
            },
        );

        render_result_list(
            f,
            list_chunks[1],
            &format!("Failed ({})", self.bad_count),
            &self.recent_bad,
            self.selected_list == 1,
            if self.selected_list == 1 {
                Some(&mut self.list_state)
            } else {
                None
            },
        );

        let status = Paragraph::new(self.status_message.clone())
            .style(if self.is_complete {
                Style::default().fg(Color::Green)
            } else {
                Style::default().fg(Color::Yellow)
            })
            .wrap(Wrap { trim: true })
            .block(Block::default().borders(Borders::ALL).title("Status"));
        f.render_widget(status, chunks[3]);
    }
}

fn render_result_list(
    f: &mut Frame,
    area: Rect,
    title: &str,
    results: &VecDeque<BatchItem>,
    is_selected: bool,
    list_state: Option<&mut ListState>,
) {
    let items: Vec<ListItem> = results
        .iter()
        .rev() // newest first
        .map(|item| ListItem::new(describe(item)).style(Style::default().fg(item_color(item))))
        .collect();

    let border_style = if is_selected {
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD)
    } else {
        Style::default()
    };

    let list = List::new(items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(title.to_string())
                .border_style(border_style),
        )
        .highlight_style(Style::default().bg(Color::DarkGray))
        .highlight_symbol(">> ");

    if let Some(state) = list_state {
        f.render_stateful_widget(list, area, state);
    } else {
        f.render_widget(list, area);
    }
}

fn describe(item: &BatchItem) -> String {
    match (item.result.latency_ms(), item.result.error()) {
        (Some(latency), _) => match &item.result.country {
            Some(country) => format!("{} {} ({:.0} ms, {})", item.name, item.address, latency, country),
            None => format!("{} {} ({:.0} ms)", item.name, item.address, latency),
        },
        (None, Some(error)) => format!("{} {}: {}", item.name, item.address, error),
        (None, None) => format!("{} {}", item.name, item.address),
    }
}

fn item_color(item: &BatchItem) -> Color {
    match item.result.latency_ms().map(LatencyClass::of) {
        Some(LatencyClass::Excellent) => Color::Green,
        Some(LatencyClass::Good) => Color::Yellow,
        Some(LatencyClass::Slow) => Color::LightRed,
        None => Color::Red,
    }
}
