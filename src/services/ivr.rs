//! IVR executor: voicemail and auto-attendant
//!
//! The voicemail machine walks named states (Welcome, PinEntry, MainMenu,
//! Playback, Options, RecordingGreeting, GreetingReview, Goodbye) with
//! exhaustive dispatch; the auto-attendant walks menu graphs from
//! configuration. Both drive prompts and recordings through a borrowed
//! media relay and consume digits from the DTMF router. A prompt that
//! cannot be read is skipped; digit collection continues regardless.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{AttendantMenu, AttendantTarget, VoicemailConfig};
use crate::media::tone::ToneGenerator;
use crate::media::wav;
use crate::services::dtmf::DtmfDigit;
use crate::services::extensions::ExtensionRecord;
use crate::services::mailbox::MailboxStore;
use crate::services::media_relay::{MediaRelay, RelayLeg};
use crate::{Error, Result};

/// Voicemail access states, in the order a caller meets them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VmState {
    Welcome,
    PinEntry,
    MainMenu,
    Playback,
    Options,
    RecordingGreeting,
    GreetingReview,
    Goodbye,
}

/// Where an attendant session ended up
#[derive(Debug, Clone, PartialEq)]
pub enum AttendantOutcome {
    /// Bridge the caller to this extension
    Transfer(String),
    /// Drop the caller into this mailbox to leave a message
    Voicemail(String),
    Hangup,
}

/// Events for observers (admin plane, tests)
#[derive(Debug, Clone)]
pub enum IvrEvent {
    StateEntered { state: String },
    PinAccepted,
    PinRejected { attempts: u8 },
    MessagePlayed { id: String },
    MessageDeleted { id: String },
    GreetingSaved,
    Finished,
}

/// One IVR session bound to a call's relay and digit stream.
///
/// The executor borrows the relay; the call keeps owning it and tears it
/// down when both legs hang up.
pub struct IvrExecutor {
    relay: Arc<MediaRelay>,
    digits: mpsc::Receiver<DtmfDigit>,
    prompt_dir: PathBuf,
    digit_timeout: Duration,
    event_tx: mpsc::UnboundedSender<IvrEvent>,
    /// Digit consumed by barge-in, waiting to be read
    pending: Option<char>,
    tones: ToneGenerator,
}

impl IvrExecutor {
    pub fn new(
        relay: Arc<MediaRelay>,
        digits: mpsc::Receiver<DtmfDigit>,
        prompt_dir: PathBuf,
        digit_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<IvrEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                relay,
                digits,
                prompt_dir,
                digit_timeout,
                event_tx,
                pending: None,
                tones: ToneGenerator::new(8000),
            },
            event_rx,
        )
    }

    fn emit(&self, event: IvrEvent) {
        let _ = self.event_tx.send(event);
    }

    fn enter(&self, state: &str) {
        debug!("IVR state {}", state);
        self.emit(IvrEvent::StateEntered {
            state: state.to_string(),
        });
    }

    // -- media helpers ----------------------------------------------------

    /// Play a prompt file toward the caller; digits barge in. A missing or
    /// unreadable prompt is skipped.
    async fn play_prompt_file(&mut self, path: &Path) {
        let audio = match wav::read_wav(path) {
            Ok(audio) => audio,
            Err(e) => {
                warn!("Skipping prompt {}: {}", path.display(), e);
                return;
            }
        };
        self.play_samples(audio.samples).await;
    }

    async fn play_named_prompt(&mut self, name: &str) {
        let path = self.prompt_dir.join(name);
        self.play_prompt_file(&path).await;
    }

    /// Play PCM with barge-in: the first digit stops playback and is held
    /// for the next collection.
    async fn play_samples(&mut self, samples: Vec<i16>) {
        if self.pending.is_some() {
            return;
        }
        let done = match self.relay.play(RelayLeg::A, samples).await {
            Ok(done) => done,
            Err(_) => return,
        };
        tokio::pin!(done);

        tokio::select! {
            _ = &mut done => {}
            digit = self.digits.recv() => {
                if let Some(digit) = digit {
                    let _ = self.relay.stop_playback().await;
                    self.pending = Some(digit.digit);
                }
            }
        }
    }

    async fn play_beep(&mut self) {
        let beep = self.tones.beep();
        self.play_samples(beep).await;
    }

    // -- digit helpers ----------------------------------------------------

    /// Next digit within the timeout
    async fn collect_digit(&mut self, timeout: Duration) -> Option<char> {
        if let Some(digit) = self.pending.take() {
            return Some(digit);
        }
        match tokio::time::timeout(timeout, self.digits.recv()).await {
            Ok(Some(digit)) => Some(digit.digit),
            _ => None,
        }
    }

    /// Collect until the terminator; returns what was gathered (without
    /// the terminator) or None when the caller went silent.
    async fn collect_until(
        &mut self,
        terminator: char,
        max_len: usize,
        timeout: Duration,
    ) -> Option<String> {
        let mut collected = String::new();
        loop {
            match self.collect_digit(timeout).await {
                Some(d) if d == terminator => return Some(collected),
                Some(d) => {
                    collected.push(d);
                    if collected.len() >= max_len {
                        return Some(collected);
                    }
                }
                None => {
                    if collected.is_empty() {
                        return None;
                    }
                    // Silence after digits counts as completion
                    return Some(collected);
                }
            }
        }
    }

    // -- voicemail: caller leaves a message -------------------------------

    /// Greeting, beep, record until `#` or the time limit, commit.
    pub async fn run_leave_message(
        mut self,
        config: &VoicemailConfig,
        mailboxes: &MailboxStore,
        mailbox: &str,
        caller: &str,
    ) -> Result<()> {
        self.enter("LeaveMessage");

        match mailboxes.greeting(mailbox) {
            Some(path) => self.play_prompt_file(&path).await,
            None => self.play_named_prompt("vm-default-greeting.wav").await,
        }
        self.play_beep().await;

        let scratch = mailboxes.scratch_path(mailbox)?;
        self.relay.record_to(scratch.clone(), RelayLeg::A).await?;

        // Record until '#', hangup (digit stream closed) or the cap
        let limit = Duration::from_secs(u64::from(config.max_message_secs));
        let _ = tokio::time::timeout(limit, async {
            loop {
                match self.digits.recv().await {
                    Some(d) if d.digit == '#' => break,
                    Some(_) => continue,
                    None => break,
                }
            }
        })
        .await;

        match self.relay.stop_recording().await {
            Ok(()) => match mailboxes.commit_message(mailbox, &scratch, caller) {
                Ok(meta) => {
                    info!("Voicemail {} left for {} by {}", meta.id, mailbox, caller);
                    self.play_named_prompt("vm-message-saved.wav").await;
                }
                Err(e) => {
                    // Disk trouble: apologize and bail out gracefully
                    warn!("Voicemail save failed for {}: {}", mailbox, e);
                    mailboxes.discard_scratch(&scratch);
                    self.play_named_prompt("vm-save-failed.wav").await;
                }
            },
            Err(e) => {
                warn!("Recording stop failed for {}: {}", mailbox, e);
                mailboxes.discard_scratch(&scratch);
                self.play_named_prompt("vm-save-failed.wav").await;
            }
        }

        self.emit(IvrEvent::Finished);
        Ok(())
    }

    // -- voicemail: mailbox owner session ---------------------------------

    /// The mailbox access flow: PIN gate, then playback and greeting
    /// management.
    pub async fn run_voicemail_access(
        mut self,
        config: &VoicemailConfig,
        mailboxes: &MailboxStore,
        extension: &ExtensionRecord,
    ) -> Result<()> {
        let mailbox = extension
            .mailbox_id
            .clone()
            .ok_or_else(|| Error::voicemail(format!("{} has no mailbox", extension.number)))?;

        let mut state = VmState::Welcome;
        let mut pin_attempts: u8 = 0;
        let mut messages = mailboxes.list_messages(&mailbox)?;
        let mut index: usize = 0;
        let mut greeting_scratch: Option<PathBuf> = None;

        loop {
            match state {
                VmState::Welcome => {
                    self.enter("Welcome");
                    self.play_named_prompt("vm-welcome.wav").await;
                    state = VmState::PinEntry;
                }

                VmState::PinEntry => {
                    self.enter("PinEntry");
                    self.play_named_prompt("vm-enter-pin.wav").await;
                    let entered = self
                        .collect_until('#', 16, self.digit_timeout)
                        .await
                        .unwrap_or_default();

                    if extension.verify_pin(&entered) {
                        self.emit(IvrEvent::PinAccepted);
                        state = VmState::MainMenu;
                    } else {
                        pin_attempts += 1;
                        self.emit(IvrEvent::PinRejected {
                            attempts: pin_attempts,
                        });
                        // Third failure ends the session, no fourth try
                        if pin_attempts >= config.max_pin_attempts {
                            self.play_named_prompt("vm-too-many-attempts.wav").await;
                            state = VmState::Goodbye;
                        } else {
                            self.play_named_prompt("vm-bad-pin.wav").await;
                        }
                    }
                }

                VmState::MainMenu => {
                    self.enter("MainMenu");
                    let (new, total) = mailboxes.message_counts(&mailbox).unwrap_or((0, 0));
                    debug!("Mailbox {}: {} new of {}", mailbox, new, total);
                    if new > 0 {
                        self.play_named_prompt("vm-new-messages.wav").await;
                    }
                    self.play_named_prompt("vm-main-menu.wav").await;

                    match self.collect_digit(self.digit_timeout).await {
                        Some('1') => {
                            messages = mailboxes.list_messages(&mailbox)?;
                            index = 0;
                            state = VmState::Playback;
                        }
                        Some('2') => state = VmState::Options,
                        Some('*') => state = VmState::Goodbye,
                        Some(_) => self.play_named_prompt("vm-invalid-option.wav").await,
                        None => state = VmState::Goodbye,
                    }
                }

                VmState::Playback => {
                    self.enter("Playback");
                    if index >= messages.len() {
                        self.play_named_prompt("vm-no-more-messages.wav").await;
                        state = VmState::MainMenu;
                        continue;
                    }

                    let message = messages[index].clone();
                    match mailboxes.message_audio(&mailbox, &message.id) {
                        Ok(audio) => {
                            self.play_samples(audio.samples).await;
                            let _ = mailboxes.mark_seen(&mailbox, &message.id);
                            self.emit(IvrEvent::MessagePlayed {
                                id: message.id.clone(),
                            });
                        }
                        Err(e) => {
                            warn!("Cannot play message {}: {}", message.id, e);
                        }
                    }

                    self.play_named_prompt("vm-message-menu.wav").await;
                    match self.collect_digit(self.digit_timeout).await {
                        // 1 replay, 2 next, 3 delete, * back
                        Some('1') => {}
                        Some('2') => index += 1,
                        Some('3') => {
                            if mailboxes.delete_message(&mailbox, &message.id).is_ok() {
                                self.emit(IvrEvent::MessageDeleted {
                                    id: message.id.clone(),
                                });
                                self.play_named_prompt("vm-message-deleted.wav").await;
                                messages = mailboxes.list_messages(&mailbox)?;
                            }
                        }
                        Some('*') => state = VmState::MainMenu,
                        Some(_) => {}
                        None => state = VmState::MainMenu,
                    }
                }

                VmState::Options => {
                    self.enter("Options");
                    state = VmState::RecordingGreeting;
                }

                VmState::RecordingGreeting => {
                    self.enter("RecordingGreeting");
                    self.play_named_prompt("vm-record-greeting.wav").await;
                    self.play_beep().await;

                    let scratch = mailboxes.scratch_path(&mailbox)?;
                    self.relay.record_to(scratch.clone(), RelayLeg::A).await?;

                    let limit = Duration::from_secs(u64::from(config.max_message_secs));
                    let _ = tokio::time::timeout(limit, async {
                        loop {
                            match self.digits.recv().await {
                                Some(d) if d.digit == '#' => break,
                                Some(_) => continue,
                                None => break,
                            }
                        }
                    })
                    .await;

                    match self.relay.stop_recording().await {
                        Ok(()) => {
                            greeting_scratch = Some(scratch);
                            state = VmState::GreetingReview;
                        }
                        Err(e) => {
                            warn!("Greeting recording failed: {}", e);
                            mailboxes.discard_scratch(&scratch);
                            self.play_named_prompt("vm-save-failed.wav").await;
                            state = VmState::MainMenu;
                        }
                    }
                }

                VmState::GreetingReview => {
                    self.enter("GreetingReview");
                    self.play_named_prompt("vm-greeting-review.wav").await;

                    match self.collect_digit(self.digit_timeout).await {
                        // 1 play, 2 re-record, 3 delete, * save and back
                        Some('1') => {
                            if let Some(scratch) = &greeting_scratch {
                                if let Ok(audio) = wav::read_wav(scratch) {
                                    self.play_samples(audio.samples).await;
                                }
                            }
                        }
                        Some('2') => {
                            if let Some(scratch) = greeting_scratch.take() {
                                mailboxes.discard_scratch(&scratch);
                            }
                            state = VmState::RecordingGreeting;
                        }
                        Some('3') => {
                            if let Some(scratch) = greeting_scratch.take() {
                                mailboxes.discard_scratch(&scratch);
                            }
                            mailboxes.delete_greeting(&mailbox)?;
                            state = VmState::MainMenu;
                        }
                        Some('*') => {
                            if let Some(scratch) = greeting_scratch.take() {
                                mailboxes.commit_greeting(&mailbox, &scratch)?;
                                self.emit(IvrEvent::GreetingSaved);
                                self.play_named_prompt("vm-greeting-saved.wav").await;
                            }
                            state = VmState::MainMenu;
                        }
                        Some(_) => {}
                        None => {
                            if let Some(scratch) = greeting_scratch.take() {
                                mailboxes.discard_scratch(&scratch);
                            }
                            state = VmState::Goodbye;
                        }
                    }
                }

                VmState::Goodbye => {
                    self.enter("Goodbye");
                    self.play_named_prompt("vm-goodbye.wav").await;
                    self.emit(IvrEvent::Finished);
                    return Ok(());
                }
            }
        }
    }

    // -- auto-attendant ---------------------------------------------------

    /// Walk attendant menus until the caller lands somewhere
    pub async fn run_attendant(
        mut self,
        menus: &HashMap<String, AttendantMenu>,
        entry: &str,
    ) -> Result<AttendantOutcome> {
        let mut current = entry.to_string();
        // A bound on menu hops keeps misconfigured graphs from looping a
        // caller forever
        for _ in 0..32 {
            let menu = menus
                .get(&current)
                .ok_or_else(|| Error::ivr(format!("Unknown attendant menu {}", current)))?;

            self.enter(&format!("Menu:{}", current));
            let greeting = self.prompt_dir.join(&menu.greeting);
            self.play_prompt_file(&greeting).await;

            let digit = self.collect_digit(self.digit_timeout).await;
            let target = match digit {
                Some(d) => menu.keys.get(&d),
                None => menu.timeout_target.as_ref(),
            };

            match target {
                Some(AttendantTarget::Extension { number }) => {
                    self.emit(IvrEvent::Finished);
                    return Ok(AttendantOutcome::Transfer(number.clone()));
                }
                Some(AttendantTarget::Voicemail { mailbox }) => {
                    self.emit(IvrEvent::Finished);
                    return Ok(AttendantOutcome::Voicemail(mailbox.clone()));
                }
                Some(AttendantTarget::Menu { name }) => {
                    current = name.clone();
                }
                Some(AttendantTarget::Hangup) | None => {
                    self.play_named_prompt("aa-goodbye.wav").await;
                    self.emit(IvrEvent::Finished);
                    return Ok(AttendantOutcome::Hangup);
                }
            }
        }

        warn!("Attendant menu loop exceeded hop limit, hanging up");
        Ok(AttendantOutcome::Hangup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PbxConfig, PortRange};
    use crate::media::g711::G711Variant;
    use crate::protocols::auth::StoredSecret;
    use crate::services::dtmf::{DtmfRouter, DtmfSource};
    use crate::services::media_relay::PortPool;
    use std::collections::HashSet;

    async fn test_relay(range: PortRange) -> Arc<MediaRelay> {
        let pool = Arc::new(PortPool::new(&range, Duration::from_millis(10)));
        let mut rtp = PbxConfig::default_config().rtp;
        rtp.port_range = range;
        Arc::new(
            MediaRelay::spawn(
                "ivr-test".to_string(),
                "127.0.0.1".parse().unwrap(),
                pool,
                &rtp,
                G711Variant::MuLaw,
                Some(101),
            )
            .await
            .unwrap(),
        )
    }

    fn extension_with_pin(pin: &str) -> ExtensionRecord {
        ExtensionRecord {
            number: "1001".to_string(),
            display_name: "Alice".to_string(),
            sip_password: "secret".to_string(),
            pin_hash: Some(StoredSecret::derive_with(pin, &[7; 8], 1000)),
            permissions: HashSet::new(),
            allow_external: false,
            mailbox_id: Some("1001".to_string()),
        }
    }

    fn vm_config() -> VoicemailConfig {
        let mut config = PbxConfig::default_config().voicemail;
        config.max_message_secs = 2;
        config
    }

    fn push_digits(router: &mut DtmfRouter, digits: &str) {
        for d in digits.chars() {
            router.push(d, DtmfSource::Rfc2833);
        }
    }

    #[tokio::test]
    async fn test_three_bad_pins_terminates() {
        let relay = test_relay(PortRange { min: 22000, max: 22020 }).await;
        let (mut router, digit_rx) = DtmfRouter::new(0);
        let dir = tempfile::tempdir().unwrap();
        let mailboxes = MailboxStore::new(dir.path());

        let (executor, mut events) = IvrExecutor::new(
            Arc::clone(&relay),
            digit_rx,
            dir.path().join("prompts"),
            Duration::from_millis(200),
        );

        // Three wrong PINs, each terminated with '#'
        push_digits(&mut router, "1111#2222#3333#");

        let extension = extension_with_pin("9999");
        executor
            .run_voicemail_access(&vm_config(), &mailboxes, &extension)
            .await
            .unwrap();

        let mut rejections = 0;
        let mut finished = false;
        while let Ok(event) = events.try_recv() {
            match event {
                IvrEvent::PinRejected { .. } => rejections += 1,
                IvrEvent::Finished => finished = true,
                IvrEvent::PinAccepted => panic!("PIN must not be accepted"),
                _ => {}
            }
        }
        assert_eq!(rejections, 3);
        assert!(finished);
        relay.stop().await;
    }

    #[tokio::test]
    async fn test_pin_login_and_exit() {
        let relay = test_relay(PortRange { min: 22020, max: 22040 }).await;
        let (mut router, digit_rx) = DtmfRouter::new(0);
        let dir = tempfile::tempdir().unwrap();
        let mailboxes = MailboxStore::new(dir.path());

        let (executor, mut events) = IvrExecutor::new(
            Arc::clone(&relay),
            digit_rx,
            dir.path().join("prompts"),
            Duration::from_millis(200),
        );

        // Correct PIN, then '*' to leave from the main menu
        push_digits(&mut router, "1234#*");

        let extension = extension_with_pin("1234");
        executor
            .run_voicemail_access(&vm_config(), &mailboxes, &extension)
            .await
            .unwrap();

        let mut accepted = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, IvrEvent::PinAccepted) {
                accepted = true;
            }
        }
        assert!(accepted);
        relay.stop().await;
    }

    #[tokio::test]
    async fn test_playback_and_delete_message() {
        let relay = test_relay(PortRange { min: 22040, max: 22060 }).await;
        let (mut router, digit_rx) = DtmfRouter::new(0);
        let dir = tempfile::tempdir().unwrap();
        let mailboxes = MailboxStore::new(dir.path());

        // Seed one message
        let scratch = mailboxes.scratch_path("1001").unwrap();
        wav::write_wav(&scratch, &vec![500i16; 800]).unwrap();
        let meta = mailboxes.commit_message("1001", &scratch, "1002").unwrap();

        let (executor, mut events) = IvrExecutor::new(
            Arc::clone(&relay),
            digit_rx,
            dir.path().join("prompts"),
            Duration::from_millis(300),
        );

        // Login, play first message (1), delete it (3), then exit (* then *)
        push_digits(&mut router, "1234#1");
        let extension = extension_with_pin("1234");

        // Feed the remaining digits after a delay so playback has begun
        let mut later_router = router;
        let feeder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            push_digits(&mut later_router, "3");
            tokio::time::sleep(Duration::from_millis(300)).await;
            push_digits(&mut later_router, "**");
        });

        executor
            .run_voicemail_access(&vm_config(), &mailboxes, &extension)
            .await
            .unwrap();
        feeder.await.unwrap();

        let mut played = false;
        let mut deleted = false;
        while let Ok(event) = events.try_recv() {
            match event {
                IvrEvent::MessagePlayed { id } if id == meta.id => played = true,
                IvrEvent::MessageDeleted { id } if id == meta.id => deleted = true,
                _ => {}
            }
        }
        assert!(played);
        assert!(deleted);
        assert!(mailboxes.list_messages("1001").unwrap().is_empty());
        relay.stop().await;
    }

    #[tokio::test]
    async fn test_attendant_digit_routes_to_extension() {
        let relay = test_relay(PortRange { min: 22060, max: 22080 }).await;
        let (mut router, digit_rx) = DtmfRouter::new(0);
        let dir = tempfile::tempdir().unwrap();

        let mut menus = HashMap::new();
        menus.insert(
            "main".to_string(),
            AttendantMenu {
                greeting: "company-greeting.wav".to_string(),
                keys: HashMap::from([
                    ('1', AttendantTarget::Extension { number: "1001".to_string() }),
                    ('2', AttendantTarget::Menu { name: "sales".to_string() }),
                ]),
                timeout_target: Some(AttendantTarget::Hangup),
            },
        );
        menus.insert(
            "sales".to_string(),
            AttendantMenu {
                greeting: "sales-greeting.wav".to_string(),
                keys: HashMap::from([
                    ('1', AttendantTarget::Voicemail { mailbox: "2001".to_string() }),
                ]),
                timeout_target: None,
            },
        );

        let (executor, _events) = IvrExecutor::new(
            Arc::clone(&relay),
            digit_rx,
            dir.path().to_path_buf(),
            Duration::from_millis(200),
        );

        // Submenu, then voicemail target
        push_digits(&mut router, "21");
        let outcome = executor.run_attendant(&menus, "main").await.unwrap();
        assert_eq!(outcome, AttendantOutcome::Voicemail("2001".to_string()));
        relay.stop().await;
    }

    #[tokio::test]
    async fn test_attendant_timeout_hangs_up() {
        let relay = test_relay(PortRange { min: 22080, max: 22100 }).await;
        let (_router, digit_rx) = DtmfRouter::new(0);
        let dir = tempfile::tempdir().unwrap();

        let mut menus = HashMap::new();
        menus.insert(
            "main".to_string(),
            AttendantMenu {
                greeting: "company-greeting.wav".to_string(),
                keys: HashMap::new(),
                timeout_target: None,
            },
        );

        let (executor, _events) = IvrExecutor::new(
            Arc::clone(&relay),
            digit_rx,
            dir.path().to_path_buf(),
            Duration::from_millis(100),
        );

        let outcome = executor.run_attendant(&menus, "main").await.unwrap();
        assert_eq!(outcome, AttendantOutcome::Hangup);
        relay.stop().await;
    }
}
