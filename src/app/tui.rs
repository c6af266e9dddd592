use std::collections::VecDeque;
use std::io::{self, Stdout};
use std::time::{Duration, Instant};

use crossterm::event::{
    self, DisableFocusChange, EnableFocusChange, Event, KeyCode, KeyEventKind, KeyModifiers,
};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{
    Block, Borders, Cell, Clear, Gauge, Paragraph, Row, Table, TableState, Tabs, Wrap,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;

use super::lifecycle::{Session, StartOutcome};
use super::probe::Probe;
use super::settings::SettingsStore;
use super::types::{CheckResult, CheckingState, Notice, UiEvent, Visibility};
use super::ui_utils::{
    centered_rect, clamp_selection, open_url_in_browser, phase_style, result_status_style,
};

const PAGE_JUMP_STEP: usize = 10;
const MAX_LOG_LINES: usize = 200;
const TICK_RATE: Duration = Duration::from_millis(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultView {
    Invalid,
    All,
}

impl ResultView {
    fn toggle(self) -> Self {
        match self {
            ResultView::Invalid => ResultView::All,
            ResultView::All => ResultView::Invalid,
        }
    }

    fn as_index(self) -> usize {
        match self {
            ResultView::Invalid => 0,
            ResultView::All => 1,
        }
    }
}

/// What the popup currently shows.
struct ViewState {
    check: CheckingState,
    view: ResultView,
    selected: usize,
    log: VecDeque<Notice>,
    help_mode: bool,
}

impl ViewState {
    fn new(check: CheckingState) -> Self {
        Self {
            check,
            view: ResultView::Invalid,
            selected: 0,
            log: VecDeque::new(),
            help_mode: false,
        }
    }

    fn handle(&mut self, event: UiEvent) {
        match event {
            UiEvent::Render(state) => self.check = *state,
            UiEvent::Notice(notice) => self.push(notice),
        }
    }

    fn push(&mut self, notice: Notice) {
        self.log.push_back(notice);
        while self.log.len() > MAX_LOG_LINES {
            self.log.pop_front();
        }
    }

    fn visible_rows(&self) -> Vec<&CheckResult> {
        self.check
            .results
            .iter()
            .filter(|result| self.view == ResultView::All || result.is_invalid())
            .collect()
    }

    fn selected_url(&self) -> Option<String> {
        let rows = self.visible_rows();
        let idx = clamp_selection(self.selected, rows.len())?;
        Some(rows[idx].url.clone())
    }

    fn move_selection(&mut self, delta: isize) {
        let len = self.visible_rows().len();
        if len == 0 {
            self.selected = 0;
            return;
        }
        let next = self.selected.saturating_add_signed(delta);
        self.selected = next.min(len - 1);
    }
}

/// Runs the popup until `q`. Session calls that await are driven on the
/// current runtime from this blocking thread.
pub fn run_tui<P: Probe>(
    mut session: Session<P>,
    settings: SettingsStore,
    folder: Option<String>,
    rx: &mut UnboundedReceiver<UiEvent>,
) -> io::Result<()> {
    let handle = Handle::current();
    tokio::task::block_in_place(|| {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableFocusChange)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;
        terminal.clear()?;

        let tui_result = draw_loop(
            &mut terminal,
            &handle,
            &mut session,
            &settings,
            folder.as_deref(),
            rx,
        );

        disable_raw_mode()?;
        execute!(
            terminal.backend_mut(),
            LeaveAlternateScreen,
            DisableFocusChange
        )?;
        terminal.show_cursor()?;

        handle.block_on(session.close());
        tui_result
    })
}

fn draw_loop<P: Probe>(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    handle: &Handle,
    session: &mut Session<P>,
    settings: &SettingsStore,
    folder: Option<&str>,
    rx: &mut UnboundedReceiver<UiEvent>,
) -> io::Result<()> {
    let mut ui = ViewState::new(session.snapshot());
    let current_settings = settings.subscribe();
    let mut table_state = TableState::default();
    let mut last_tick = Instant::now();
    let scope_label = folder.map_or_else(|| "all folders".to_string(), |id| format!("folder {id}"));

    loop {
        while let Ok(event) = rx.try_recv() {
            ui.handle(event);
        }
        let proxy_label = {
            let current = current_settings.borrow();
            if current.enable_proxy_retry {
                format!(
                    "{} {}:{}",
                    current.proxy_type.scheme(),
                    current.proxy_address,
                    current.proxy_port
                )
            } else {
                "off".to_string()
            }
        };

        terminal.draw(|f| {
            let chunks = Layout::default()
                .direction(Direction::Vertical)
                .constraints([
                    Constraint::Length(4),
                    Constraint::Length(3),
                    Constraint::Min(8),
                    Constraint::Length(7),
                    Constraint::Length(3),
                ])
                .split(f.area());

            let check = &ui.check;
            let title = if check.is_checking {
                if check.should_cancel {
                    "deadmark - Cancelling"
                } else {
                    "deadmark - Checking"
                }
            } else {
                "deadmark - Idle (press c to check, q to quit)"
            };
            let metric_label = Style::default().fg(Color::Gray);
            let sep_style = Style::default().fg(Color::DarkGray);
            let invalid = check.invalid_count();
            let header_lines = vec![
                Line::from(vec![
                    Span::styled("Bookmarks ", metric_label),
                    Span::styled(
                        check.total_count.to_string(),
                        Style::default()
                            .fg(Color::Cyan)
                            .add_modifier(Modifier::BOLD),
                    ),
                    Span::styled("  |  ", sep_style),
                    Span::styled("Checked ", metric_label),
                    Span::styled(
                        check.checked_count.to_string(),
                        Style::default().fg(Color::LightCyan),
                    ),
                    Span::styled("  |  ", sep_style),
                    Span::styled("Invalid ", metric_label),
                    Span::styled(
                        invalid.to_string(),
                        Style::default().fg(if invalid == 0 {
                            Color::Green
                        } else {
                            Color::LightRed
                        }),
                    ),
                ]),
                Line::from(vec![
                    Span::styled("Phase ", metric_label),
                    Span::styled(check.phase.label(), phase_style(check.phase)),
                    Span::styled("  |  ", sep_style),
                    Span::styled("Batch ", metric_label),
                    Span::raw(check.batch_size.to_string()),
                    Span::styled("  |  ", sep_style),
                    Span::styled("Scope ", metric_label),
                    Span::raw(scope_label.clone()),
                    Span::styled("  |  ", sep_style),
                    Span::styled("Proxy retry ", metric_label),
                    Span::raw(proxy_label.clone()),
                ]),
            ];
            let header = Paragraph::new(header_lines)
                .block(
                    Block::default()
                        .title(title)
                        .borders(Borders::ALL)
                        .border_style(Style::default().fg(if check.is_checking {
                            Color::Cyan
                        } else {
                            Color::Green
                        })),
                )
                .wrap(Wrap { trim: true });
            f.render_widget(header, chunks[0]);

            let controls = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Length(24), Constraint::Min(20)])
                .split(chunks[1]);
            let hotkey_style = Style::default()
                .fg(Color::White)
                .add_modifier(Modifier::BOLD);
            let tab_label_style = Style::default().fg(Color::Gray);
            let tabs = Tabs::new(vec![
                Line::from(vec![Span::styled(" Invalid", tab_label_style)]),
                Line::from(vec![Span::styled(" All", tab_label_style)]),
            ])
            .select(ui.view.as_index())
            .block(
                Block::default()
                    .title(Line::from(vec![
                        Span::styled("a", hotkey_style),
                        Span::raw(" View"),
                    ]))
                    .borders(Borders::ALL),
            )
            .highlight_style(
                Style::default()
                    .fg(Color::Cyan)
                    .add_modifier(Modifier::BOLD),
            );
            f.render_widget(tabs, controls[0]);

            let progress = check.progress();
            let gauge = Gauge::default()
                .block(Block::default().title("Progress").borders(Borders::ALL))
                .gauge_style(
                    Style::default()
                        .fg(if check.is_checking {
                            Color::Cyan
                        } else {
                            Color::Green
                        })
                        .bg(Color::Black)
                        .add_modifier(Modifier::BOLD),
                )
                .percent(u16::from(progress.min(100)))
                .label(format!(
                    "{progress}% | {}/{} | {}",
                    check.checked_count,
                    check.total_count,
                    check.phase.label()
                ));
            f.render_widget(gauge, controls[1]);

            let rows = ui.visible_rows();
            table_state.select(clamp_selection(ui.selected, rows.len()));
            let table_rows = rows.iter().map(|result| {
                Row::new(vec![
                    Cell::from(result.status_label()).style(result_status_style(result)),
                    Cell::from(result.title.clone()),
                    Cell::from(result.url.clone()),
                ])
            });
            let table_title = match ui.view {
                ResultView::Invalid => format!("Invalid bookmarks ({})", rows.len()),
                ResultView::All => format!("All results ({})", rows.len()),
            };
            let table = Table::new(
                table_rows,
                [
                    Constraint::Length(12),
                    Constraint::Percentage(35),
                    Constraint::Min(20),
                ],
            )
            .header(
                Row::new(vec!["Status", "Title", "URL"]).style(
                    Style::default()
                        .fg(Color::Yellow)
                        .add_modifier(Modifier::BOLD),
                ),
            )
            .block(Block::default().title(table_title).borders(Borders::ALL))
            .row_highlight_style(
                Style::default()
                    .bg(Color::DarkGray)
                    .add_modifier(Modifier::BOLD),
            );
            f.render_stateful_widget(table, chunks[2], &mut table_state);

            let log_height = chunks[3].height.saturating_sub(2) as usize;
            let log_lines: Vec<Line> = ui
                .log
                .iter()
                .rev()
                .take(log_height)
                .rev()
                .map(|notice| {
                    let style = if notice.is_error() {
                        Style::default().fg(Color::LightRed)
                    } else {
                        Style::default().fg(Color::Gray)
                    };
                    Line::from(Span::styled(notice.to_string(), style))
                })
                .collect();
            f.render_widget(
                Paragraph::new(log_lines)
                    .block(Block::default().title("Status").borders(Borders::ALL))
                    .wrap(Wrap { trim: true }),
                chunks[3],
            );

            let key = |k: &'static str| Span::styled(k, hotkey_style);
            let label = |l: &'static str| Span::styled(l, tab_label_style);
            let footer = Paragraph::new(Line::from(vec![
                key("c"),
                label(if check.is_checking { " cancel  " } else { " check  " }),
                key("d"),
                label(" delete  "),
                key("D"),
                label(" delete invalid  "),
                key("r"),
                label(" recheck  "),
                key("R"),
                label(" recheck invalid  "),
                key("enter"),
                label(" open  "),
                key("?"),
                label(" help  "),
                key("q"),
                label(" quit"),
            ]))
            .block(Block::default().title("Keys").borders(Borders::ALL));
            f.render_widget(footer, chunks[4]);

            if ui.help_mode {
                let area = centered_rect(64, 50, f.area());
                f.render_widget(Clear, area);
                f.render_widget(
                    Paragraph::new(vec![
                        Line::from("Navigation"),
                        Line::from("  up/down or j/k: move selection"),
                        Line::from("  pgup/pgdn: jump by 10 rows"),
                        Line::from("  g/G or home/end: first/last row"),
                        Line::from("  a: switch between invalid and all results"),
                        Line::from(""),
                        Line::from("Actions"),
                        Line::from("  c: start a check, or cancel the running one"),
                        Line::from("  d: delete the selected bookmark"),
                        Line::from("  D: delete every invalid bookmark"),
                        Line::from("  r: recheck the selected URL"),
                        Line::from("  R: recheck every invalid bookmark"),
                        Line::from("  enter: open the selected URL"),
                        Line::from(""),
                        Line::from("Press ? or Esc to close."),
                    ])
                    .block(
                        Block::default()
                            .title("Help")
                            .borders(Borders::ALL)
                            .border_style(Style::default().fg(Color::Yellow)),
                    )
                    .wrap(Wrap { trim: true }),
                    area,
                );
            }
        })?;

        let timeout = TICK_RATE.saturating_sub(last_tick.elapsed());
        if event::poll(timeout)? {
            match event::read()? {
                Event::FocusLost => session.on_visibility(Visibility::Hidden),
                Event::FocusGained => session.on_visibility(Visibility::Visible),
                Event::Key(key) if key.kind == KeyEventKind::Press => {
                    if ui.help_mode {
                        if matches!(
                            key.code,
                            KeyCode::Esc | KeyCode::Enter | KeyCode::Char('?')
                        ) {
                            ui.help_mode = false;
                        }
                        continue;
                    }
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => break,
                        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                            break;
                        }
                        KeyCode::Char('c') => {
                            match handle.block_on(session.start_check(folder)) {
                                Ok(StartOutcome::AlreadyCancelling) => {
                                    ui.push(Notice::Cancelling);
                                }
                                Ok(_) => ui.selected = 0,
                                Err(err) => ui.push(Notice::Error(err.to_string())),
                            }
                        }
                        KeyCode::Char('d') => {
                            if let Some(url) = ui.selected_url() {
                                if let Err(err) = session.delete_result(&url) {
                                    ui.push(Notice::Error(format!("delete failed: {err}")));
                                }
                            }
                        }
                        KeyCode::Char('D') => {
                            session.delete_invalid();
                            ui.selected = 0;
                        }
                        KeyCode::Char('r') => {
                            if let Some(url) = ui.selected_url() {
                                handle.block_on(session.recheck(&url));
                            }
                        }
                        KeyCode::Char('R') => {
                            handle.block_on(session.recheck_invalid());
                        }
                        KeyCode::Char('a') => {
                            ui.view = ui.view.toggle();
                            ui.selected = 0;
                        }
                        KeyCode::Char('?') => ui.help_mode = true,
                        KeyCode::Enter => {
                            if let Some(url) = ui.selected_url() {
                                if let Err(err) = open_url_in_browser(&url) {
                                    ui.push(Notice::Error(format!(
                                        "failed to open link in browser: {err}"
                                    )));
                                }
                            }
                        }
                        KeyCode::Down | KeyCode::Char('j') => ui.move_selection(1),
                        KeyCode::Up | KeyCode::Char('k') => ui.move_selection(-1),
                        KeyCode::PageDown => ui.move_selection(PAGE_JUMP_STEP as isize),
                        KeyCode::PageUp => ui.move_selection(-(PAGE_JUMP_STEP as isize)),
                        KeyCode::Home | KeyCode::Char('g') => ui.selected = 0,
                        KeyCode::End | KeyCode::Char('G') => ui.move_selection(isize::MAX),
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        if last_tick.elapsed() >= TICK_RATE {
            last_tick = Instant::now();
            if settings.reload() {
                tracing::info!("settings changed on disk");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view_with(statuses: &[Option<bool>]) -> ViewState {
        let mut check = CheckingState::start(
            statuses
                .iter()
                .enumerate()
                .map(|(i, _)| CheckResult::pending(format!("t{i}"), format!("http://{i}")))
                .collect(),
            5,
        );
        for (result, status) in check.results.iter_mut().zip(statuses) {
            result.status = *status;
        }
        ViewState::new(check)
    }

    #[test]
    fn invalid_view_selects_only_failures() {
        let mut ui = view_with(&[Some(true), Some(false), None, Some(false)]);
        assert_eq!(ui.selected_url().as_deref(), Some("http://1"));
        ui.move_selection(5);
        assert_eq!(ui.selected_url().as_deref(), Some("http://3"));

        ui.view = ui.view.toggle();
        ui.selected = 0;
        assert_eq!(ui.visible_rows().len(), 4);
        ui.move_selection(-3);
        assert_eq!(ui.selected, 0);
    }

    #[test]
    fn render_events_replace_the_shown_state() {
        let mut ui = view_with(&[]);
        assert_eq!(ui.selected_url(), None);
        let next = view_with(&[Some(false)]).check;
        ui.handle(UiEvent::Render(Box::new(next.clone())));
        ui.handle(UiEvent::Notice(Notice::Started { total: 1 }));
        assert_eq!(ui.check, next);
        assert_eq!(ui.log.back(), Some(&Notice::Started { total: 1 }));
    }
}
