use crate::client::RelayClient;
use crate::consumer::{lock, run_turn, Conversation, SharedConversation, TurnState};
use crate::platform::{Platform, SystemPlatform};
use crate::protocol::{Message, Sender};
use crate::speech::{CommandSpeech, NoSpeech, SpeechOutput};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use crossterm::cursor::MoveTo;
use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Paragraph, Widget, Wrap};
use ratatui::{Frame, Terminal, TerminalOptions, Viewport};
use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

type TuiTerminal = Terminal<CrosstermBackend<io::Stdout>>;
type UiResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const VIEWPORT_HEIGHT: u16 = 7;

pub struct ChatConfig {
    pub url: String,
    pub muted: bool,
    pub speech_command: Option<String>,
}

// Restores terminal settings even if the loop exits early.
struct TerminalGuard;

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = io::stdout().flush();
    }
}

#[derive(Debug, Clone)]
enum ChatMessage {
    User { text: String, has_image: bool },
    Assistant(String),
    System(String),
    Info(String),
}

impl From<&Message> for ChatMessage {
    fn from(message: &Message) -> Self {
        match message.sender {
            Sender::User => ChatMessage::User {
                text: message.text.clone(),
                has_image: message.image.is_some(),
            },
            Sender::Ai => ChatMessage::Assistant(message.text.clone()),
            Sender::System => ChatMessage::System(message.text.clone()),
        }
    }
}

#[derive(Debug, Clone)]
struct LineSpec {
    text: String,
    style: Style,
}

impl LineSpec {
    fn new(text: impl Into<String>, style: Style) -> Self {
        Self {
            text: text.into(),
            style,
        }
    }
}

fn labelled(label: &str, body: &str, color: Color) -> Vec<LineSpec> {
    let header_style = Style::default().fg(color).add_modifier(Modifier::BOLD);
    let body_style = Style::default().fg(color);
    let mut lines = vec![LineSpec::new(label, header_style)];
    for line in body.lines() {
        lines.push(LineSpec::new(format!("  {}", line), body_style));
    }
    lines
}

impl ChatMessage {
    fn line_specs(&self) -> Vec<LineSpec> {
        match self {
            ChatMessage::User { text, has_image } => {
                let mut lines = labelled("You:", text, Color::Blue);
                if *has_image {
                    lines.push(LineSpec::new(
                        "  [image attached]",
                        Style::default().fg(Color::Blue).add_modifier(Modifier::DIM),
                    ));
                }
                lines
            }
            ChatMessage::Assistant(text) => labelled("AI:", text, Color::Yellow),
            ChatMessage::System(text) => vec![LineSpec::new(
                format!("⚙ {}", text),
                Style::default().fg(Color::Green),
            )],
            ChatMessage::Info(text) => vec![LineSpec::new(
                format!("ℹ {}", text),
                Style::default()
                    .fg(Color::Gray)
                    .add_modifier(Modifier::ITALIC),
            )],
        }
    }

    fn to_text(&self) -> Text<'static> {
        let lines = self
            .line_specs()
            .into_iter()
            .map(|spec| Line::from(Span::styled(spec.text, spec.style)))
            .collect::<Vec<_>>();
        Text::from(lines)
    }

    fn rendered_height(&self, width: u16) -> u16 {
        let width = width.max(1) as usize;
        self.line_specs()
            .iter()
            .map(|spec| spec.text.chars().count().max(1).div_ceil(width))
            .sum::<usize>()
            .min(u16::MAX as usize) as u16
    }
}

#[derive(Debug)]
enum UiEvent {
    Info(String),
}

/// Multi-line input with a cursor counted in characters, not bytes.
struct InputBuffer {
    lines: Vec<String>,
    cursor_x: usize,
    cursor_y: usize,
}

fn byte_index(line: &str, char_idx: usize) -> usize {
    line.char_indices()
        .nth(char_idx)
        .map(|(idx, _)| idx)
        .unwrap_or(line.len())
}

impl InputBuffer {
    fn new() -> Self {
        Self {
            lines: vec![String::new()],
            cursor_x: 0,
            cursor_y: 0,
        }
    }

    fn clear(&mut self) {
        *self = Self::new();
    }

    fn line_len(&self, y: usize) -> usize {
        self.lines[y].chars().count()
    }

    fn insert_char(&mut self, c: char) {
        let line = &mut self.lines[self.cursor_y];
        let idx = byte_index(line, self.cursor_x);
        line.insert(idx, c);
        self.cursor_x += 1;
    }

    fn delete_char(&mut self) {
        if self.cursor_x > 0 {
            let line = &mut self.lines[self.cursor_y];
            let idx = byte_index(line, self.cursor_x - 1);
            line.remove(idx);
            self.cursor_x -= 1;
        } else if self.cursor_y > 0 {
            let tail = self.lines.remove(self.cursor_y);
            self.cursor_y -= 1;
            self.cursor_x = self.line_len(self.cursor_y);
            self.lines[self.cursor_y].push_str(&tail);
        }
    }

    fn new_line(&mut self) {
        let line = &mut self.lines[self.cursor_y];
        let idx = byte_index(line, self.cursor_x);
        let tail = line.split_off(idx);
        self.lines.insert(self.cursor_y + 1, tail);
        self.cursor_y += 1;
        self.cursor_x = 0;
    }

    fn move_left(&mut self) {
        if self.cursor_x > 0 {
            self.cursor_x -= 1;
        } else if self.cursor_y > 0 {
            self.cursor_y -= 1;
            self.cursor_x = self.line_len(self.cursor_y);
        }
    }

    fn move_right(&mut self) {
        if self.cursor_x < self.line_len(self.cursor_y) {
            self.cursor_x += 1;
        } else if self.cursor_y + 1 < self.lines.len() {
            self.cursor_y += 1;
            self.cursor_x = 0;
        }
    }

    fn move_up(&mut self) {
        if self.cursor_y > 0 {
            self.cursor_y -= 1;
            self.cursor_x = self.cursor_x.min(self.line_len(self.cursor_y));
        }
    }

    fn move_down(&mut self) {
        if self.cursor_y + 1 < self.lines.len() {
            self.cursor_y += 1;
            self.cursor_x = self.cursor_x.min(self.line_len(self.cursor_y));
        }
    }

    fn contents(&self) -> String {
        self.lines.join("\n")
    }

    fn is_empty(&self) -> bool {
        self.lines.iter().all(|l| l.is_empty())
    }

    fn render(&self) -> Text<'static> {
        if self.is_empty() {
            return Text::from(Span::styled(
                "Type a message, or /image <path>, /mute, /clear",
                Style::default().fg(Color::DarkGray),
            ));
        }
        Text::from(
            self.lines
                .iter()
                .map(|l| Line::from(l.clone()))
                .collect::<Vec<_>>(),
        )
    }
}

enum Command<'a> {
    Clear,
    Mute,
    Image(&'a str),
    Unknown(&'a str),
}

fn parse_command(input: &str) -> Option<Command<'_>> {
    let rest = input.trim().strip_prefix('/')?;
    let (name, arg) = rest.split_once(' ').unwrap_or((rest, ""));
    Some(match name {
        "clear" => Command::Clear,
        "mute" => Command::Mute,
        "image" => Command::Image(arg.trim()),
        _ => Command::Unknown(name),
    })
}

/// Reads an image file into a `data:` URL.
fn image_data_url(path: &Path) -> Result<String, String> {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    if mime.type_() != mime_guess::mime::IMAGE {
        return Err(format!("{} is not an image ({})", path.display(), mime));
    }
    let bytes = std::fs::read(path).map_err(|e| format!("Could not read {}: {}", path.display(), e))?;
    Ok(format!("data:{};base64,{}", mime, STANDARD.encode(bytes)))
}

/// Keeps the last `max` characters of the final line of `text`.
fn streaming_tail(text: &str, max: usize) -> String {
    let last = text.lines().last().unwrap_or_default();
    let count = last.chars().count();
    last.chars().skip(count.saturating_sub(max)).collect()
}

struct App {
    input: InputBuffer,
    should_quit: bool,
    sender: mpsc::Sender<UiEvent>,
    receiver: mpsc::Receiver<UiEvent>,
    conversation: SharedConversation,
    printed: usize,
    pending_image: Option<String>,
    client: RelayClient,
    platform: Arc<dyn Platform>,
    speech: Arc<dyn SpeechOutput>,
}

impl App {
    fn new(config: ChatConfig) -> Self {
        let (sender, receiver) = mpsc::channel(100);
        let mut conversation = Conversation::new();
        conversation.set_muted(config.muted);

        let speech: Arc<dyn SpeechOutput> = match config
            .speech_command
            .as_deref()
            .and_then(CommandSpeech::from_command_line)
        {
            Some(speech) => Arc::new(speech),
            None => Arc::new(NoSpeech),
        };

        Self {
            input: InputBuffer::new(),
            should_quit: false,
            sender,
            receiver,
            conversation: conversation.into_shared(),
            printed: 0,
            pending_image: None,
            client: RelayClient::new(&config.url),
            platform: Arc::new(SystemPlatform),
            speech,
        }
    }

    fn draw(&mut self, f: &mut Frame) {
        let [status_area, input_area] =
            Layout::vertical([Constraint::Length(1), Constraint::Min(3)]).areas(f.area());

        let (state, muted, tail) = {
            let conversation = lock(&self.conversation);
            let tail = conversation
                .in_progress()
                .map(|m| streaming_tail(&m.text, status_area.width.saturating_sub(6) as usize))
                .unwrap_or_default();
            (conversation.state(), conversation.muted(), tail)
        };

        let status = match state {
            TurnState::Streaming if !tail.is_empty() => {
                Span::styled(format!("AI: {}", tail), Style::default().fg(Color::Yellow))
            }
            TurnState::Sending | TurnState::Streaming => {
                Span::styled("AI is thinking...", Style::default().fg(Color::Yellow))
            }
            _ => {
                let mut flags = Vec::new();
                if muted {
                    flags.push("speaker muted");
                }
                if self.pending_image.is_some() {
                    flags.push("image ready");
                }
                Span::styled(flags.join(" · "), Style::default().fg(Color::DarkGray))
            }
        };
        f.render_widget(Paragraph::new(Line::from(status)), status_area);

        let input_paragraph = Paragraph::new(self.input.render())
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(" Input (Enter to send, Esc to quit) ")
                    .border_style(Style::default().fg(Color::DarkGray)),
            )
            .wrap(Wrap { trim: false });
        f.render_widget(input_paragraph, input_area);

        let cursor_x = (self.input.cursor_x + 1) as u16;
        let cursor_y = self.input.cursor_y as u16;
        let x = (input_area.x + cursor_x).min(input_area.x + input_area.width - 2);
        let y = (input_area.y + 1 + cursor_y).min(input_area.y + input_area.height - 2);
        f.set_cursor_position((x, y));
    }

    fn append_message(&mut self, terminal: &mut TuiTerminal, message: ChatMessage) -> UiResult<()> {
        let width = terminal.size()?.width;
        let height = message.rendered_height(width).saturating_add(1);
        let mut text = message.to_text();
        text.extend(Text::raw("\n"));
        // Insert above the inline viewport so the log stays in scrollback.
        terminal.insert_before(height, |buf| {
            let paragraph = Paragraph::new(text).wrap(Wrap { trim: false });
            paragraph.render(buf.area, buf);
        })?;
        Ok(())
    }

    /// Prints every settled message that has not reached scrollback yet. The
    /// in-progress assistant message stays in the viewport until it settles.
    fn flush_conversation(&mut self, terminal: &mut TuiTerminal) -> UiResult<()> {
        let settled: Vec<ChatMessage> = {
            let conversation = lock(&self.conversation);
            let in_progress = conversation.in_progress().map(|m| m.id);
            let messages = conversation.messages();
            self.printed = self.printed.min(messages.len());
            messages[self.printed..]
                .iter()
                .take_while(|m| Some(m.id) != in_progress)
                .map(ChatMessage::from)
                .collect()
        };

        self.printed += settled.len();
        for message in settled {
            self.append_message(terminal, message)?;
        }
        Ok(())
    }

    fn run_command(&mut self, terminal: &mut TuiTerminal, command: Command<'_>) -> UiResult<()> {
        match command {
            Command::Clear => {
                self.speech.cancel();
                lock(&self.conversation).clear();
                self.printed = 0;
                self.pending_image = None;
                self.append_message(terminal, ChatMessage::Info("Chat cleared.".to_string()))?;
            }
            Command::Mute => {
                self.speech.cancel();
                let muted = {
                    let mut conversation = lock(&self.conversation);
                    let muted = !conversation.muted();
                    conversation.set_muted(muted);
                    muted
                };
                let notice = if muted { "Speaker muted." } else { "Speaker unmuted." };
                self.append_message(terminal, ChatMessage::Info(notice.to_string()))?;
            }
            Command::Image(path) if path.is_empty() => {
                self.pending_image = None;
                self.append_message(terminal, ChatMessage::Info("Image removed.".to_string()))?;
            }
            Command::Image(path) => match image_data_url(Path::new(path)) {
                Ok(url) => {
                    self.pending_image = Some(url);
                    self.append_message(
                        terminal,
                        ChatMessage::Info("Image ready. Ask a question!".to_string()),
                    )?;
                }
                Err(err) => self.append_message(terminal, ChatMessage::Info(err))?,
            },
            Command::Unknown(name) => {
                self.append_message(
                    terminal,
                    ChatMessage::Info(format!("Unknown command: /{}", name)),
                )?;
            }
        }
        Ok(())
    }

    fn submit(&mut self, terminal: &mut TuiTerminal) -> UiResult<()> {
        let text = self.input.contents();
        if let Some(command) = parse_command(&text) {
            self.run_command(terminal, command)?;
            self.input.clear();
            return Ok(());
        }

        if lock(&self.conversation).is_busy() {
            return Ok(());
        }
        if text.trim().is_empty() && self.pending_image.is_none() {
            return Ok(());
        }

        self.input.clear();
        let image = self.pending_image.take();
        let conversation = Arc::clone(&self.conversation);
        let client = self.client.clone();
        let platform = Arc::clone(&self.platform);
        let speech = Arc::clone(&self.speech);
        let sender = self.sender.clone();

        tokio::spawn(async move {
            let result = run_turn(
                &conversation,
                &client,
                &text,
                image,
                platform.as_ref(),
                speech.as_ref(),
            )
            .await;
            if let Err(err) = result {
                let _ = sender.send(UiEvent::Info(err.to_string())).await;
            }
        });

        Ok(())
    }

    fn handle_events(&mut self, terminal: &mut TuiTerminal) -> UiResult<bool> {
        while let Ok(event) = self.receiver.try_recv() {
            match event {
                UiEvent::Info(msg) => self.append_message(terminal, ChatMessage::Info(msg))?,
            }
        }

        self.flush_conversation(terminal)?;

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c')
                {
                    self.should_quit = true;
                    return Ok(false);
                }

                match key.code {
                    KeyCode::Esc => {
                        self.should_quit = true;
                        return Ok(false);
                    }
                    KeyCode::Enter if key.modifiers.contains(KeyModifiers::SHIFT) => {
                        self.input.new_line();
                    }
                    KeyCode::Enter => self.submit(terminal)?,
                    KeyCode::Char(c) => self.input.insert_char(c),
                    KeyCode::Backspace => self.input.delete_char(),
                    KeyCode::Left => self.input.move_left(),
                    KeyCode::Right => self.input.move_right(),
                    KeyCode::Up => self.input.move_up(),
                    KeyCode::Down => self.input.move_down(),
                    KeyCode::Home => self.input.cursor_x = 0,
                    KeyCode::End => {
                        self.input.cursor_x = self.input.line_len(self.input.cursor_y);
                    }
                    _ => {}
                }
            }
        }

        Ok(true)
    }
}

pub fn run_tui(config: ChatConfig) -> UiResult<()> {
    enable_raw_mode()?;
    let _guard = TerminalGuard;

    let mut stdout = io::stdout();
    let (_, rows) = size()?;
    if rows > 0 {
        // Push existing screen content into scrollback without clearing it.
        for _ in 0..rows {
            writeln!(stdout)?;
        }
        stdout.flush()?;
    }
    execute!(stdout, MoveTo(0, 0))?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::with_options(
        backend,
        TerminalOptions {
            viewport: Viewport::Inline(VIEWPORT_HEIGHT),
        },
    )?;

    let mut app = App::new(config);
    tracing::info!(relay = app.client.base_url(), "chat client started");

    terminal.draw(|f| app.draw(f))?;

    while !app.should_quit {
        if !app.handle_events(&mut terminal)? {
            break;
        }

        terminal.draw(|f| app.draw(f))?;

        std::thread::sleep(Duration::from_millis(10));
    }

    app.speech.cancel();
    Ok(())
}
