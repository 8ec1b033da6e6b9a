// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2022-2025 1BitSquared <info@1bitsquared.com>
//! The re-restore classifier: given a cached ticket issued for an unknown ramdisk variant,
//! works out whether it actually signs the "Erase" or "Update" identity by hashing the candidate
//! ramdisk and searching for that hash inside the ticket body.

use log::{debug, info, warn};

use crate::error::Error;
use crate::image3::SignedImage;
use crate::ipsw::Ipsw;
use crate::manifest::{BuildIdentity, BuildManifest, RestoreBehavior};

const RAMDISK_COMPONENT: &str = "RestoreRamDisk";
const DIGEST_LEN: usize = 0x14;

/// The two-state retry loop from the reference's `goto retry` / `goto rdcheckdone`, made
/// explicit rather than implicit in jump targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State
{
    TryingCurrent,
    TryingSwap,
    Done,
}

/// Result of classification: the identity the session should actually use, and whether the
/// ticket turned out to be for a custom (unsigned) ramdisk rather than either known variant.
pub struct ClassifierOutcome
{
    pub identity: BuildIdentity,
    pub flag_custom: bool,
}

struct Classifier<'a>
{
    manifest: &'a BuildManifest,
    ipsw: &'a Ipsw,
    model: &'a str,
    ap_ticket: &'a [u8],
    identity: BuildIdentity,
    state: State,
    flag_custom: bool,
}

impl<'a> Classifier<'a>
{
    fn step(&mut self) -> Result<(), Error>
    {
        self.state = match self.state {
            State::TryingCurrent => self.try_current()?,
            State::TryingSwap => self.try_swap()?,
            State::Done => State::Done,
        };

        Ok(())
    }

    fn try_current(&mut self) -> Result<State, Error>
    {
        let ramdisk_path = self.identity.get_component_path(RAMDISK_COMPONENT)?;
        let ramdisk = self.ipsw.extract_to_memory(ramdisk_path)?;
        let image = SignedImage::new(&ramdisk);

        if image.is_unsigned() {
            info!("ramdisk at offset 0x0C reports unsigned; treating ticket as a custom restore");
            self.flag_custom = true;
            return Ok(State::Done);
        }

        let digest = image.body_digest();
        if ticket_contains_digest(self.ap_ticket, &digest) {
            debug!("ticket matches {} ramdisk digest", self.identity.restore_behavior()?.as_str());
            Ok(State::Done)
        } else {
            Ok(State::TryingSwap)
        }
    }

    fn try_swap(&mut self) -> Result<State, Error>
    {
        let current_behavior = self.identity.restore_behavior()?;
        let swapped_behavior = current_behavior.opposite();

        match self.manifest.get_identity_by_model_behavior(self.model, Some(swapped_behavior)) {
            Ok(swapped) => {
                self.identity = swapped;
                self.try_current_after_swap()
            },
            Err(_) => {
                warn!("no {} identity exists to swap to; falling back to Erase", swapped_behavior.as_str());
                if current_behavior != RestoreBehavior::Erase {
                    self.identity = self.manifest.get_identity_by_model_behavior(self.model, Some(RestoreBehavior::Erase))?;
                }
                Ok(State::Done)
            },
        }
    }

    /// The retry is "at most once": after swapping we test the new identity's ramdisk directly
    /// rather than looping back through [State::TryingCurrent] and risking a third attempt.
    fn try_current_after_swap(&mut self) -> Result<State, Error>
    {
        let ramdisk_path = self.identity.get_component_path(RAMDISK_COMPONENT)?;
        let ramdisk = self.ipsw.extract_to_memory(ramdisk_path)?;
        let image = SignedImage::new(&ramdisk);

        if image.is_unsigned() || !ticket_contains_digest(self.ap_ticket, &image.body_digest()) {
            info!("second attempt also missed; declaring a custom restore and pinning to Erase");
            self.flag_custom = true;
            if self.identity.restore_behavior()? != RestoreBehavior::Erase {
                self.identity = self.manifest.get_identity_by_model_behavior(self.model, Some(RestoreBehavior::Erase))?;
            }
        } else {
            debug!("ticket matches swapped identity's ramdisk digest");
        }

        Ok(State::Done)
    }
}

fn ticket_contains_digest(ticket: &[u8], digest: &[u8; DIGEST_LEN]) -> bool
{
    if ticket.len() < DIGEST_LEN {
        return false;
    }

    ticket.windows(DIGEST_LEN).any(|window| window == digest)
}

/// Runs the classifier to completion, starting from `initial_identity` (conventionally the
/// "Erase" identity).
pub fn classify(
    manifest: &BuildManifest,
    ipsw: &Ipsw,
    model: &str,
    ap_ticket: &[u8],
    initial_identity: BuildIdentity,
) -> Result<ClassifierOutcome, Error>
{
    let mut classifier = Classifier {
        manifest,
        ipsw,
        model,
        ap_ticket,
        identity: initial_identity,
        state: State::TryingCurrent,
        flag_custom: false,
    };

    while classifier.state != State::Done {
        classifier.step()?;
    }

    Ok(ClassifierOutcome { identity: classifier.identity, flag_custom: classifier.flag_custom })
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn ticket_contains_digest_finds_embedded_match()
    {
        let mut ticket = vec![0xFFu8; 100];
        let digest = [7u8; DIGEST_LEN];
        ticket[40..40 + DIGEST_LEN].copy_from_slice(&digest);

        assert!(ticket_contains_digest(&ticket, &digest));
    }

    #[test]
    fn ticket_contains_digest_false_when_absent()
    {
        let ticket = vec![0xFFu8; 100];
        let digest = [7u8; DIGEST_LEN];

        assert!(!ticket_contains_digest(&ticket, &digest));
    }

    #[test]
    fn ticket_shorter_than_digest_never_matches()
    {
        let ticket = vec![7u8; 10];
        let digest = [7u8; DIGEST_LEN];

        assert!(!ticket_contains_digest(&ticket, &digest));
    }
}
