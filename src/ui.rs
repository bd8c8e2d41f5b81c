use crate::client::AppSnapshot;
use color_eyre::eyre::{Result, eyre};
use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use futures::StreamExt;
use itertools::Itertools;
use ratatui::prelude::*;
use ratatui::widgets::*;
use std::io::stdout;
use team_lottery::submitter::MutationPhase;
use team_lottery::validation::{GuessForm, RegisterTeamForm};

pub enum UserEvent {
    Quit,
    ToggleConnection,
    NextNetwork,
    Refresh,
    SubmitRegistration(RegisterTeamForm),
    SubmitGuess(GuessForm),
    Redraw,
}

pub type InputEventReceiver = EventStream;

#[derive(Default)]
pub struct UiState {
    mode: Mode,
    terminal: Option<Terminal<CrosstermBackend<std::io::Stdout>>>,
}

#[derive(Clone, Debug, Default, PartialEq)]
enum Mode {
    #[default]
    Normal,
    RegisterModal(RegisterState),
    GuessModal(GuessState),
    QuitModal,
}

#[derive(Clone, Debug, Default, PartialEq)]
struct RegisterState { form: RegisterTeamForm, focus: usize }

#[derive(Clone, Debug, Default, PartialEq)]
struct GuessState { form: GuessForm, focus: usize }

const REGISTER_FIELDS: usize = 3;
const GUESS_FIELDS: usize = 2;

pub fn terminal_enter(state: &mut UiState) -> Result<()> {
    enable_raw_mode()?;
    crossterm::execute!(std::io::stdout(), crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout());
    let terminal = Terminal::new(backend)?;
    state.terminal = Some(terminal);
    Ok(())
}

pub fn terminal_exit() -> Result<()> {
    disable_raw_mode()?;
    crossterm::execute!(std::io::stdout(), crossterm::terminal::LeaveAlternateScreen)?;
    Ok(())
}

pub fn input_event_stream() -> InputEventReceiver {
    EventStream::new()
}

pub async fn next_raw_event(events: &mut InputEventReceiver) -> Result<Event> {
    match events.next().await {
        Some(event) => Ok(event?),
        None => Err(eyre!("terminal input stream closed")),
    }
}

pub fn draw(state: &mut UiState, snap: &AppSnapshot) -> Result<()> {
    if let Some(mut term) = state.terminal.take() {
        let res = term.draw(|f| ui(f, state, snap)).map(|_| ());
        state.terminal = Some(term);
        res?;
    }
    Ok(())
}

/// Maps a terminal event to an app action, updating modal state on the way.
pub fn interpret_event(state: &mut UiState, snap: &AppSnapshot, event: Event) -> Option<UserEvent> {
    match event {
        Event::Resize(..) => Some(UserEvent::Redraw),
        Event::Key(k) if k.kind == KeyEventKind::Press => interpret_key(state, snap, k),
        _ => None,
    }
}

fn interpret_key(state: &mut UiState, snap: &AppSnapshot, k: KeyEvent) -> Option<UserEvent> {
    if k.code == KeyCode::Char('c') && k.modifiers.contains(KeyModifiers::CONTROL) {
        return Some(UserEvent::Quit);
    }
    match &mut state.mode {
        Mode::RegisterModal(rs) => {
            match k.code {
                KeyCode::Esc => { state.mode = Mode::Normal; Some(UserEvent::Redraw) }
                KeyCode::Tab | KeyCode::Down => { rs.focus = (rs.focus + 1) % REGISTER_FIELDS; Some(UserEvent::Redraw) }
                KeyCode::BackTab | KeyCode::Up => { rs.focus = (rs.focus + REGISTER_FIELDS - 1) % REGISTER_FIELDS; Some(UserEvent::Redraw) }
                KeyCode::Backspace => { register_field(&mut rs.form, rs.focus).pop(); Some(UserEvent::Redraw) }
                KeyCode::Char(c) => { register_field(&mut rs.form, rs.focus).push(c); Some(UserEvent::Redraw) }
                KeyCode::Enter if snap.register_phase.is_busy() => None,
                KeyCode::Enter => Some(UserEvent::SubmitRegistration(rs.form.clone())),
                _ => None,
            }
        }
        Mode::GuessModal(gs) => {
            match k.code {
                KeyCode::Esc => { state.mode = Mode::Normal; Some(UserEvent::Redraw) }
                KeyCode::Tab | KeyCode::BackTab | KeyCode::Down | KeyCode::Up => { gs.focus = (gs.focus + 1) % GUESS_FIELDS; Some(UserEvent::Redraw) }
                KeyCode::Backspace => { guess_field(&mut gs.form, gs.focus).pop(); Some(UserEvent::Redraw) }
                KeyCode::Char(c) => { guess_field(&mut gs.form, gs.focus).push(c); Some(UserEvent::Redraw) }
                KeyCode::Enter if snap.guess_phase.is_busy() => None,
                KeyCode::Enter => Some(UserEvent::SubmitGuess(gs.form.clone())),
                _ => None,
            }
        }
        Mode::QuitModal => {
            match k.code {
                KeyCode::Char('y') | KeyCode::Char('Y') => Some(UserEvent::Quit),
                KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => { state.mode = Mode::Normal; Some(UserEvent::Redraw) }
                _ => None,
            }
        }
        Mode::Normal => {
            match k.code {
                KeyCode::Char('q') | KeyCode::Esc => { state.mode = Mode::QuitModal; Some(UserEvent::Redraw) }
                KeyCode::Char('c') => Some(UserEvent::ToggleConnection),
                KeyCode::Char('n') => Some(UserEvent::NextNetwork),
                KeyCode::Char('r') => Some(UserEvent::Refresh),
                KeyCode::Char('t') => { state.mode = Mode::RegisterModal(RegisterState::default()); Some(UserEvent::Redraw) }
                KeyCode::Char('g') => { state.mode = Mode::GuessModal(GuessState::default()); Some(UserEvent::Redraw) }
                _ => None,
            }
        }
    }
}

fn register_field(form: &mut RegisterTeamForm, focus: usize) -> &mut String {
    match focus {
        0 => &mut form.name,
        1 => &mut form.wallet,
        _ => &mut form.password,
    }
}

fn guess_field(form: &mut GuessForm, focus: usize) -> &mut String {
    match focus {
        0 => &mut form.team,
        _ => &mut form.guess,
    }
}

fn ui(f: &mut Frame, state: &UiState, snap: &AppSnapshot) {
    f.render_widget(Clear, f.area());
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(4), // connection
            Constraint::Min(8),    // teams
            Constraint::Length(8), // errors
            Constraint::Length(3), // help
        ])
        .split(f.area());

    draw_top(f, chunks[0], snap);
    draw_teams(f, chunks[1], snap);
    draw_errors(f, chunks[2], snap);
    draw_help(f, chunks[3]);
    draw_modals(f, state, snap);
}

fn draw_top(f: &mut Frame, area: Rect, snap: &AppSnapshot) {
    let conn = &snap.connection;
    let account = conn.account.map(|a| a.to_checksum(None)).unwrap_or_else(|| "not connected".to_string());
    let chain = conn.chain_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string());
    let balance = match snap.teams.balance.as_ref() {
        Some(b) => b.display(),
        None => "-".to_string(),
    };
    let state = if conn.connected { Span::styled("Connected", Style::default().fg(Color::Green)) } else { Span::styled("Disconnected", Style::default().fg(Color::DarkGray)) };
    let lines = vec![
        Line::from(vec![state, Span::raw(format!(" | Network: {} (chain {}) | Account: {}", conn.network, chain, account))]),
        Line::from(format!("Lottery Balance: {} | {}", balance, snap.status)),
    ];
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Team Lottery"));
    f.render_widget(p, area);
}

fn draw_teams(f: &mut Frame, area: Rect, snap: &AppSnapshot) {
    let title = if snap.refreshing { "Teams (refreshing...)" } else { "Teams" };
    let block = Block::default().borders(Borders::ALL).title(title);
    if !snap.connection.connected {
        f.render_widget(Paragraph::new("Connect a wallet with 'c' to load teams.").block(block), area);
        return;
    }
    if snap.connection.contract.is_none() {
        let msg = "No Lottery contract deployed on this network. Press 'n' to switch.";
        f.render_widget(Paragraph::new(msg).style(Style::default().fg(Color::Yellow)).block(block), area);
        return;
    }
    if !snap.teams.is_loaded() {
        f.render_widget(Paragraph::new("Loading teams...").block(block), area);
        return;
    }
    let teams = snap.teams.teams_by_score();
    if teams.is_empty() {
        f.render_widget(Paragraph::new("No teams registered yet.").block(block), area);
        return;
    }
    let rows = teams.iter().enumerate().map(|(i, t)| {
        Row::new(vec![
            Cell::from(format!("{}", i + 1)),
            Cell::from(t.name.clone()),
            Cell::from(t.address.to_checksum(None)),
            Cell::from(t.score.to_string()),
        ])
    });
    let header = Row::new(vec!["#", "Team", "Wallet", "Score"]).style(Style::default().add_modifier(Modifier::BOLD));
    let table = Table::new(rows, [Constraint::Length(4), Constraint::Percentage(30), Constraint::Length(44), Constraint::Min(6)])
        .header(header)
        .block(block);
    f.render_widget(table, area);
}

fn draw_errors(f: &mut Frame, area: Rect, snap: &AppSnapshot) {
    let visible = area.height.saturating_sub(2) as usize;
    let lines: Vec<Line> = if snap.errors.is_empty() {
        vec![Line::from("No errors")]
    } else {
        snap.errors.iter().rev().take(visible).rev().map(|e| Line::from(e.clone())).collect()
    };
    let color = if snap.errors.is_empty() { Color::DarkGray } else { Color::Red };
    let errors = Paragraph::new(lines)
        .wrap(Wrap { trim: true })
        .block(Block::default().borders(Borders::ALL).title("Errors"));
    f.render_widget(errors.style(Style::default().fg(color)), area);
}

fn draw_help(f: &mut Frame, area: Rect) {
    let keys = [
        "c connect/disconnect",
        "n next network",
        "r refresh",
        "t register team",
        "g make a guess",
        "q/Esc quit",
    ];
    let help = Paragraph::new(keys.iter().join(" | ")).block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(help, area);
}

fn draw_modals(f: &mut Frame, state: &UiState, snap: &AppSnapshot) {
    match &state.mode {
        Mode::RegisterModal(rs) => {
            let area = centered_rect(60, 50, f.area());
            let block = Block::default().borders(Borders::ALL).title("Register Team");
            let masked = "*".repeat(rs.form.password.chars().count());
            let mut lines = vec![
                field_line("Team name", &rs.form.name, rs.focus == 0),
                field_line("Wallet", &rs.form.wallet, rs.focus == 1),
                field_line("Password", &masked, rs.focus == 2),
                Line::from(""),
                Line::styled(format!("(Requires a {} deposit)", snap.deposit), Style::default().fg(Color::DarkGray)),
            ];
            lines.extend(phase_line(&snap.register_phase));
            lines.push(submit_hint(&snap.register_phase, "register"));
            f.render_widget(Clear, area);
            f.render_widget(block.clone(), area);
            f.render_widget(Paragraph::new(lines).wrap(Wrap { trim: false }), block.inner(area));
        }
        Mode::GuessModal(gs) => {
            let area = centered_rect(60, 40, f.area());
            let block = Block::default().borders(Borders::ALL).title("Make a Guess");
            let mut lines = vec![
                field_line("Team wallet", &gs.form.team, gs.focus == 0),
                field_line("Guess", &gs.form.guess, gs.focus == 1),
                Line::from(""),
            ];
            lines.extend(phase_line(&snap.guess_phase));
            lines.push(submit_hint(&snap.guess_phase, "guess"));
            f.render_widget(Clear, area);
            f.render_widget(block.clone(), area);
            f.render_widget(Paragraph::new(lines).wrap(Wrap { trim: false }), block.inner(area));
        }
        Mode::QuitModal => {
            let area = centered_rect(40, 20, f.area());
            let block = Block::default().borders(Borders::ALL).title("Confirm Quit");
            let p = Paragraph::new("Quit team-lottery? (Y/N)");
            f.render_widget(Clear, area);
            f.render_widget(block.clone(), area);
            f.render_widget(p, block.inner(area));
        }
        Mode::Normal => {}
    }
}

fn field_line(label: &str, value: &str, focused: bool) -> Line<'static> {
    let cur = if focused { ">" } else { " " };
    let style = if focused { Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD) } else { Style::default() };
    Line::styled(format!("{cur} {label}: {value}"), style)
}

fn phase_line(phase: &MutationPhase) -> Option<Line<'static>> {
    let (text, color) = phase_text(phase)?;
    Some(Line::styled(text, Style::default().fg(color)))
}

fn phase_text(phase: &MutationPhase) -> Option<(String, Color)> {
    match phase {
        MutationPhase::Idle => None,
        MutationPhase::Submitting => Some(("Submitting...".to_string(), Color::Yellow)),
        MutationPhase::Confirming { .. } => Some(("Waiting for confirmation...".to_string(), Color::Yellow)),
        MutationPhase::Confirmed { hash } => Some((format!("Transaction confirmed: {hash}"), Color::Green)),
        MutationPhase::Failed(err) => Some((err.to_string(), Color::Red)),
    }
}

fn submit_hint(phase: &MutationPhase, verb: &str) -> Line<'static> {
    if phase.is_busy() {
        Line::styled("Enter disabled while the transaction is pending | Esc close", Style::default().fg(Color::DarkGray))
    } else {
        Line::from(format!("Enter={verb} Tab=next field Esc=close"))
    }
}

fn centered_rect(w_percent: u16, h_percent: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - h_percent) / 2),
            Constraint::Percentage(h_percent),
            Constraint::Percentage((100 - h_percent) / 2),
        ])
        .split(r);

    let vertical = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - w_percent) / 2),
            Constraint::Percentage(w_percent),
            Constraint::Percentage((100 - w_percent) / 2),
        ])
        .split(popup_layout[1]);

    vertical[1]
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::client::ConnectionView;
    use alloy::primitives::TxHash;
    use std::sync::Arc;
    use team_lottery::types::TeamSnapshot;

    fn snapshot() -> AppSnapshot {
        AppSnapshot {
            connection: ConnectionView {
                connected: true,
                account: None,
                chain_id: Some(1337),
                network: "localhost".to_string(),
                contract: None,
            },
            teams: Arc::new(TeamSnapshot::default()),
            refreshing: false,
            register_phase: MutationPhase::Idle,
            guess_phase: MutationPhase::Idle,
            deposit: "0.01 ETH".to_string(),
            status: String::new(),
            errors: Vec::new(),
        }
    }

    fn key(code: KeyCode) -> Event {
        Event::Key(KeyEvent::new(code, KeyModifiers::NONE))
    }

    fn type_text(state: &mut UiState, snap: &AppSnapshot, text: &str) {
        for c in text.chars() {
            interpret_event(state, snap, key(KeyCode::Char(c)));
        }
    }

    #[test]
    fn interpret_event__register_form_collects_fields_in_tab_order() {
        // given
        let mut state = UiState::default();
        let snap = snapshot();
        interpret_event(&mut state, &snap, key(KeyCode::Char('t')));

        // when
        type_text(&mut state, &snap, "Default Team");
        interpret_event(&mut state, &snap, key(KeyCode::Tab));
        type_text(&mut state, &snap, "0x0000000000000000000000000000000000000000");
        interpret_event(&mut state, &snap, key(KeyCode::Tab));
        type_text(&mut state, &snap, "hunter2");
        let submitted = interpret_event(&mut state, &snap, key(KeyCode::Enter));

        // then
        let Some(UserEvent::SubmitRegistration(form)) = submitted else {
            panic!("expected a registration submit");
        };
        assert_eq!(form.name, "Default Team");
        assert_eq!(form.wallet, "0x0000000000000000000000000000000000000000");
        assert_eq!(form.password, "hunter2");
    }

    #[test]
    fn interpret_event__submit_is_ignored_while_guess_is_pending() {
        // given
        let mut state = UiState::default();
        let mut snap = snapshot();
        snap.guess_phase = MutationPhase::Confirming { hash: TxHash::ZERO };
        interpret_event(&mut state, &snap, key(KeyCode::Char('g')));

        // when
        let submitted = interpret_event(&mut state, &snap, key(KeyCode::Enter));

        // then
        assert!(submitted.is_none());
        assert!(matches!(state.mode, Mode::GuessModal(_)));
    }

    #[test]
    fn interpret_event__quit_requires_confirmation() {
        let mut state = UiState::default();
        let snap = snapshot();

        assert!(matches!(interpret_event(&mut state, &snap, key(KeyCode::Char('q'))), Some(UserEvent::Redraw)));
        assert_eq!(state.mode, Mode::QuitModal);
        assert!(matches!(interpret_event(&mut state, &snap, key(KeyCode::Char('y'))), Some(UserEvent::Quit)));
    }

    #[test]
    fn phase_text__failed_shows_error_verbatim() {
        let err = team_lottery::error::MutationError::Stale;
        let (text, _) = phase_text(&MutationPhase::Failed(err.clone())).unwrap();
        assert_eq!(text, err.to_string());
        assert!(phase_text(&MutationPhase::Idle).is_none());
    }
}
