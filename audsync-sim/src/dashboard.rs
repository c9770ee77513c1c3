//! Terminal dashboard for the simulated room

use crate::metrics::{format_secs, LogLevel, Metrics, SimStatus};
use crate::sim::{self, SimOptions};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use parking_lot::RwLock;
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, List, ListItem, Paragraph, Row, Scrollbar, ScrollbarOrientation, ScrollbarState, Table},
    Frame, Terminal,
};
use std::io::stdout;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// How long to wait for devices to leave after quitting
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Dashboard state for scrolling etc.
struct DashboardState {
    /// Log scroll position (0 = most recent at bottom)
    log_scroll: usize,
    /// Whether auto-scroll is enabled (follows new logs)
    auto_scroll: bool,
    /// Log sequence at the last frame, to notice new entries
    seen_log_seq: u64,
}

/// Run the dashboard
pub async fn run(metrics: Arc<RwLock<Metrics>>, options: SimOptions) -> Result<(), Box<dyn std::error::Error>> {
    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = ratatui::backend::CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // Start the room in background
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics_for_sim = Arc::clone(&metrics);
    let sim_task = tokio::spawn(async move {
        if let Err(e) = sim::run(metrics_for_sim.clone(), options, shutdown_rx).await {
            let mut m = metrics_for_sim.write();
            m.status = SimStatus::Error;
            m.log(LogLevel::Error, format!("Simulation failed: {}", e));
        }
    });

    let mut state = DashboardState {
        log_scroll: 0,
        auto_scroll: true,
        seen_log_seq: 0,
    };

    // Main loop
    let tick_rate = Duration::from_millis(100);
    let mut should_quit = false;

    while !should_quit {
        let (log_count, log_seq) = {
            let m = metrics.read();
            (m.logs.len(), m.log_seq)
        };
        follow_new_logs(&mut state, log_seq);

        terminal.draw(|f| draw(f, &metrics, &state))?;

        if event::poll(tick_rate)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => should_quit = true,
                        KeyCode::Char('c') if key.modifiers.contains(event::KeyModifiers::CONTROL) => {
                            should_quit = true
                        }
                        // Scroll up (older logs)
                        KeyCode::Up | KeyCode::Char('k') => scroll_up(&mut state, log_count, 1),
                        // Scroll down (newer logs)
                        KeyCode::Down | KeyCode::Char('j') => scroll_down(&mut state, 1),
                        KeyCode::PageUp => scroll_up(&mut state, log_count, 10),
                        KeyCode::PageDown => scroll_down(&mut state, 10),
                        // Home - oldest logs
                        KeyCode::Home => scroll_up(&mut state, log_count, log_count),
                        // End - newest logs (enable auto-scroll)
                        KeyCode::End => scroll_down(&mut state, log_count),
                        // Toggle auto-scroll
                        KeyCode::Char('a') => {
                            state.auto_scroll = !state.auto_scroll;
                            if state.auto_scroll {
                                state.log_scroll = 0;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    // Let devices leave gracefully before tearing the terminal down
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(SHUTDOWN_GRACE, sim_task).await.is_err() {
        metrics.write().log(LogLevel::Warning, "Devices did not leave in time");
    }

    // Cleanup
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    Ok(())
}

/// New entries keep the view pinned to the bottom while auto-scrolling
fn follow_new_logs(state: &mut DashboardState, log_seq: u64) {
    if log_seq != state.seen_log_seq {
        state.seen_log_seq = log_seq;
        if state.auto_scroll {
            state.log_scroll = 0;
        }
    }
}

fn scroll_up(state: &mut DashboardState, log_count: usize, by: usize) {
    if log_count > 0 {
        state.log_scroll = (state.log_scroll + by).min(log_count.saturating_sub(1));
        state.auto_scroll = false;
    }
}

fn scroll_down(state: &mut DashboardState, by: usize) {
    state.log_scroll = state.log_scroll.saturating_sub(by);
    if state.log_scroll == 0 {
        state.auto_scroll = true;
    }
}

/// Draw the dashboard
fn draw(f: &mut Frame, metrics: &Arc<RwLock<Metrics>>, state: &DashboardState) {
    let m = metrics.read();

    let device_rows = m.devices.len() as u16 + 3;
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),           // Header
            Constraint::Length(5),           // Stats
            Constraint::Length(device_rows), // Devices
            Constraint::Min(8),              // Logs
            Constraint::Length(1),           // Footer
        ])
        .split(f.area());

    draw_header(f, chunks[0], &m);
    draw_stats(f, chunks[1], &m);
    draw_devices(f, chunks[2], &m);
    draw_logs(f, chunks[3], &m, state);
    draw_footer(f, chunks[4], state);
}

fn draw_header(f: &mut Frame, area: Rect, m: &Metrics) {
    let (status_text, status_color) = match m.status {
        SimStatus::Starting => ("STARTING", Color::Yellow),
        SimStatus::Running => ("RUNNING", Color::Green),
        SimStatus::Stopping => ("STOPPING", Color::Yellow),
        SimStatus::Error => ("ERROR", Color::Red),
    };

    let title = vec![Line::from(vec![
        Span::styled("audsync room", Style::default().add_modifier(Modifier::BOLD)),
        Span::raw("  │  Code: "),
        Span::styled(
            m.room_code.clone().unwrap_or_else(|| "......".to_string()),
            Style::default().fg(Color::Yellow),
        ),
        Span::raw("  │  Status: "),
        Span::styled(status_text, Style::default().fg(status_color)),
        Span::raw("  │  Uptime: "),
        Span::styled(m.uptime(), Style::default().fg(Color::Cyan)),
    ])];

    let header = Paragraph::new(title).block(Block::default().borders(Borders::ALL).title(" Dashboard "));
    f.render_widget(header, area);
}

fn draw_stats(f: &mut Frame, area: Rect, m: &Metrics) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(area);

    let (position, stamped) = m
        .playback
        .as_ref()
        .map(|p| (format_secs(p.position), format!("{} · {:?}", p.timestamp, p.source)))
        .unwrap_or_else(|| ("-".to_string(), "-".to_string()));

    let playback_info = vec![
        Line::from(Span::styled(m.now_playing(), Style::default().fg(Color::Green))),
        Line::from(vec![
            Span::raw("Position: "),
            Span::styled(position, Style::default().fg(Color::Cyan)),
        ]),
        Line::from(vec![
            Span::raw("Written: "),
            Span::styled(stamped, Style::default().fg(Color::DarkGray)),
        ]),
    ];
    let playback_block =
        Paragraph::new(playback_info).block(Block::default().borders(Borders::ALL).title(" Playback "));
    f.render_widget(playback_block, chunks[0]);

    let present = m.devices.iter().filter(|d| d.present).count();
    let room_info = vec![
        Line::from(vec![
            Span::raw("Present: "),
            Span::styled(
                format!("{} / {}", present, m.devices.len()),
                Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
            ),
        ]),
        Line::from(vec![
            Span::raw("Corrections: "),
            Span::styled(m.total_corrections.to_string(), Style::default().fg(Color::Magenta)),
        ]),
        Line::from(vec![
            Span::raw("Evictions: "),
            Span::styled(m.evictions.to_string(), Style::default().fg(Color::Yellow)),
        ]),
    ];
    let room_block = Paragraph::new(room_info).block(Block::default().borders(Borders::ALL).title(" Room "));
    f.render_widget(room_block, chunks[1]);
}

fn draw_devices(f: &mut Frame, area: Rect, m: &Metrics) {
    let header = Row::new(["Device", "Skew", "Rate", "Drift", "Max", "Fixes", "Player", "Last sync"])
        .style(Style::default().add_modifier(Modifier::BOLD));

    let rows: Vec<Row> = m
        .devices
        .iter()
        .map(|d| {
            let name_style = if !d.present {
                Style::default().fg(Color::DarkGray)
            } else if d.is_host {
                Style::default().fg(Color::Yellow)
            } else {
                Style::default()
            };
            let drift_color = if d.last_drift.abs() > 1.5 {
                Color::Red
            } else if d.last_drift.abs() > 0.5 {
                Color::Yellow
            } else {
                Color::Green
            };
            let name = if d.is_host { format!("★ {}", d.name) } else { d.name.clone() };

            Row::new(vec![
                Cell::from(name).style(name_style),
                Cell::from(format!("{:+}ms", d.skew_ms)),
                Cell::from(format!("{:.3}", d.rate)),
                Cell::from(format!("{:+.2}s", d.last_drift)).style(Style::default().fg(drift_color)),
                Cell::from(format!("{:.2}s", d.max_drift)),
                Cell::from(d.corrections.to_string()),
                Cell::from(d.transport.clone()),
                Cell::from(
                    d.last_sync
                        .map(|t| t.format("%H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string()),
                ),
            ])
        })
        .collect();

    let widths = [
        Constraint::Min(14),
        Constraint::Length(9),
        Constraint::Length(6),
        Constraint::Length(8),
        Constraint::Length(7),
        Constraint::Length(6),
        Constraint::Length(10),
        Constraint::Length(9),
    ];
    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(" Devices "));
    f.render_widget(table, area);
}

fn draw_logs(f: &mut Frame, area: Rect, m: &Metrics, state: &DashboardState) {
    let visible_height = area.height.saturating_sub(2) as usize;
    let total_logs = m.logs.len();

    let log_items: Vec<ListItem> = m
        .logs
        .iter()
        .rev()
        .skip(state.log_scroll)
        .take(visible_height)
        .map(|entry| {
            let level_style = match entry.level {
                LogLevel::Info => Style::default().fg(Color::Blue),
                LogLevel::Warning => Style::default().fg(Color::Yellow),
                LogLevel::Error => Style::default().fg(Color::Red),
                LogLevel::Host => Style::default().fg(Color::Cyan),
                LogLevel::Sync => Style::default().fg(Color::Magenta),
                LogLevel::Presence => Style::default().fg(Color::Green),
            };

            let time = entry.timestamp.format("%H:%M:%S").to_string();

            ListItem::new(Line::from(vec![
                Span::styled(format!("{} ", time), Style::default().fg(Color::DarkGray)),
                Span::styled(format!("[{}] ", entry.level.as_str()), level_style),
                Span::raw(&entry.message),
            ]))
        })
        .collect();

    let scroll_indicator = if state.auto_scroll {
        " [AUTO] ".to_string()
    } else if total_logs > 0 {
        format!(" [{}/{}] ", total_logs - state.log_scroll, total_logs)
    } else {
        String::new()
    };

    let logs = List::new(log_items).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!(" Activity Log{}", scroll_indicator)),
    );
    f.render_widget(logs, area);

    if total_logs > visible_height {
        let scrollbar = Scrollbar::new(ScrollbarOrientation::VerticalRight)
            .begin_symbol(Some("↑"))
            .end_symbol(Some("↓"));

        let mut scrollbar_state =
            ScrollbarState::new(total_logs).position(total_logs.saturating_sub(state.log_scroll + visible_height));

        f.render_stateful_widget(
            scrollbar,
            area.inner(ratatui::layout::Margin { vertical: 1, horizontal: 0 }),
            &mut scrollbar_state,
        );
    }
}

fn draw_footer(f: &mut Frame, area: Rect, state: &DashboardState) {
    let auto_text = if state.auto_scroll { "ON " } else { "OFF" };
    let auto_color = if state.auto_scroll { Color::Green } else { Color::Yellow };
    let key = Style::default().fg(Color::Black).bg(Color::White);

    let footer = Paragraph::new(Line::from(vec![
        Span::styled(" Q ", key),
        Span::raw(" Quit  "),
        Span::styled(" ↑↓ ", key),
        Span::raw(" Scroll  "),
        Span::styled(" PgUp/Dn ", key),
        Span::raw(" Page  "),
        Span::styled(" A ", key),
        Span::raw(" Auto-scroll: "),
        Span::styled(auto_text, Style::default().fg(auto_color)),
    ]));

    f.render_widget(footer, area);
}
