//! `carlink pair` and `carlink reconnect`: full handshakes over the loopback.
//!
//! The head unit persists into the real key store, so a device paired here
//! shows up in `carlink devices` and can be reconnected later.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use carlink_channel::{Companion, FileKeyStorage, KeyStorage, OperationType, SecureChannel};
use carlink_core::{Config, VerificationMode};
use carlink_crypto::{Ukey2Runner, format_code_display};
use dialoguer::Confirm;
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::time::timeout;
use tracing::{info, info_span};
use uuid::Uuid;

use crate::loopback::{EventLog, HeadUnitEvent, check_head_unit, link, relay_once};

/// Settings for a loopback handshake, resolved from config and flags.
#[derive(Debug, Clone)]
pub struct PairOptions {
    pub out_of_band: bool,
    pub code_digits: u8,
    pub challenge_secret_bytes: usize,
    pub timeout: Duration,
    /// Skip the confirmation prompt.
    pub auto_accept: bool,
}

impl PairOptions {
    pub fn from_config(config: &Config, out_of_band: bool, auto_accept: bool) -> Self {
        Self {
            out_of_band: out_of_band
                || config.channel.verification_mode == VerificationMode::OutOfBand,
            code_digits: config.channel.verification_code_digits,
            challenge_secret_bytes: config.storage.challenge_secret_bytes,
            timeout: Duration::from_secs(config.channel.handshake_timeout_secs),
            auto_accept,
        }
    }
}

/// Result of a successful association.
#[derive(Debug, Clone)]
pub struct Paired {
    pub device_id: Uuid,
    pub head_unit_id: Uuid,
    pub code: String,
}

/// Associate a freshly generated phone identity with the head unit.
pub async fn pair(key_store: &Path, options: &PairOptions) -> anyhow::Result<Paired> {
    let storage = FileKeyStorage::open(key_store, options.challenge_secret_bytes)
        .with_context(|| format!("Failed to open key store {}", key_store.display()))?;
    let (stream, mut frames) = link();
    let events = EventLog::default();
    let shown = EventCode::default();

    let runner = Ukey2Runner::responder()
        .with_out_of_band(options.out_of_band)
        .with_code_digits(options.code_digits);
    let mut car = SecureChannel::association(stream, runner, storage)
        .with_span(info_span!("head_unit", flavor = "association"));
    car.set_callback(events.clone());
    let code_slot = shown.clone();
    car.set_show_verification_code_listener(Some(Box::new(move |code: &str| {
        code_slot.set(code);
    })));

    let device_id = Uuid::new_v4();
    let mut secret = vec![0u8; options.challenge_secret_bytes];
    OsRng.fill_bytes(&mut secret);
    let phone_runner = Ukey2Runner::initiator()
        .with_out_of_band(options.out_of_band)
        .with_code_digits(options.code_digits);
    let mut phone = Companion::associate(phone_runner, device_id, secret);

    // Key agreement, up to the point where the user must compare codes.
    timeout(options.timeout, async {
        car.on_message_received(phone.start()?, OperationType::EncryptionHandshake);
        check_head_unit(&car, &events)?;
        relay_once(&mut car, &mut phone, &mut frames).await?;
        check_head_unit(&car, &events)
    })
    .await
    .context("Handshake timed out before verification")??;

    let car_code = shown.get().context("Head unit did not show a verification code")?;
    let phone_code = phone
        .verification()
        .map(carlink_channel::Verification::display)
        .context("Phone did not derive a verification code")?;
    let mut out = std::io::stdout();
    show_codes(&mut out, &car_code, &phone_code)?;

    if !options.auto_accept && !confirm_codes()? {
        bail!("Pairing cancelled");
    }

    timeout(options.timeout, async {
        phone.accept_verification()?;
        car.notify_out_of_band_accepted();
        check_head_unit(&car, &events)?;
        relay_once(&mut car, &mut phone, &mut frames).await?;
        check_head_unit(&car, &events)
    })
    .await
    .context("Handshake timed out after verification")??;

    if !car.is_established() || !events.events().contains(&HeadUnitEvent::Established) {
        bail!("Head unit did not confirm the pairing");
    }
    let head_unit_id = phone
        .car_unique_id()
        .context("Phone did not receive the head unit id")?;
    info!(%device_id, %head_unit_id, "pairing complete");
    Ok(Paired {
        device_id,
        head_unit_id,
        code: car_code,
    })
}

/// Re-establish a session with a paired device using its stored key.
pub async fn reconnect(
    key_store: &Path,
    device_id: Uuid,
    options: &PairOptions,
) -> anyhow::Result<()> {
    let storage = FileKeyStorage::open(key_store, options.challenge_secret_bytes)
        .with_context(|| format!("Failed to open key store {}", key_store.display()))?;
    let id = device_id.to_string();
    let Some(previous_key) = storage.encryption_key(&id) else {
        bail!("Device {id} is not paired");
    };

    let (stream, mut frames) = link();
    let events = EventLog::default();
    let mut car = SecureChannel::reconnect(stream, Ukey2Runner::responder(), storage, id)
        .with_span(info_span!("head_unit", flavor = "reconnect"));
    car.set_callback(events.clone());
    let mut phone = Companion::reconnect(Ukey2Runner::initiator(), previous_key);

    timeout(options.timeout, async {
        car.on_message_received(phone.start()?, OperationType::EncryptionHandshake);
        check_head_unit(&car, &events)?;
        // Server init out; client finish and proof back.
        relay_once(&mut car, &mut phone, &mut frames).await?;
        check_head_unit(&car, &events)?;
        // Head unit proof out.
        relay_once(&mut car, &mut phone, &mut frames).await?;
        check_head_unit(&car, &events)
    })
    .await
    .context("Reconnect timed out")??;

    if !car.is_established() || !phone.is_established() {
        bail!("Reconnect did not complete");
    }
    info!(%device_id, "session resumed");
    Ok(())
}

fn show_codes(out: &mut impl std::io::Write, car: &str, phone: &str) -> anyhow::Result<()> {
    writeln!(out, "Head unit shows: {}", format_code_display(car))?;
    writeln!(out, "Phone shows:     {}", format_code_display(phone))?;
    Ok(())
}

fn confirm_codes() -> anyhow::Result<bool> {
    let confirmed = tokio::task::block_in_place(|| {
        Confirm::new()
            .with_prompt("Do both devices show the same code?")
            .default(true)
            .interact()
    })?;
    Ok(confirmed)
}

/// Last code shown by the head unit.
#[derive(Debug, Clone, Default)]
struct EventCode(std::sync::Arc<std::sync::Mutex<Option<String>>>);

impl EventCode {
    fn set(&self, code: &str) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some(code.to_string());
        }
    }

    fn get(&self) -> Option<String> {
        self.0.lock().ok().and_then(|slot| slot.clone())
    }
}
