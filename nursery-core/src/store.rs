use bitcoin::{OutPoint, Transaction};

use crate::output::{BabyOutput, KidOutput};
use crate::SendSync;

/// Error returned by the nursery store
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Store is temporarily unavailable, might work later
    Unavailable(String),
    /// Needed record is missing
    NotFound(String),
    /// Record already present with conflicting contents
    AlreadyExists(String),
    /// A persisted record failed to decode - fatal, the process must not
    /// run against this database
    Corrupt(String),
    /// Non-recoverable internal error
    Internal(String),
}

/// The lifecycle stage of a tracked output.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    /// A baby awaiting its CLTV expiry and timeout confirmation
    Crib,
    /// A kid awaiting confirmation of its creating transaction
    Preschool,
    /// A kid with a known confirmation height, awaiting maturity
    Kindergarten,
    /// Swept; removed once the whole channel has graduated
    Graduated,
}

/// A stored output together with its stage.
#[derive(Clone, Debug, PartialEq)]
pub enum NurseryRecord {
    /// A kid in preschool, kindergarten or graduated
    Kid(KidOutput),
    /// A baby in the crib
    Baby(BabyOutput),
}

impl NurseryRecord {
    /// The kid view of the record.
    pub fn kid(&self) -> &KidOutput {
        match self {
            NurseryRecord::Kid(kid) => kid,
            NurseryRecord::Baby(baby) => baby.kid(),
        }
    }
}

/// Durable, atomic state storage for the nursery.
///
/// Every operation is a single atomic commit: intermediate crash states
/// that would leave the channel index, the height index and the per-output
/// stage disagreeing are forbidden.
pub trait NurseryStore: SendSync {
    /// Insert babies into the crib and kids into preschool (or directly
    /// into kindergarten when their confirmation height is already known)
    /// and file the height index. Re-inserting an already tracked
    /// outpoint is a no-op.
    fn incubate(&self, kids: &[KidOutput], babies: &[BabyOutput]) -> Result<(), Error>;

    /// Replace a crib record with its kid form in kindergarten. The baby's
    /// inner kid must carry the confirmation height of the timeout
    /// transaction. A record already promoted is left untouched.
    fn crib_to_kinder(&self, baby: &BabyOutput) -> Result<(), Error>;

    /// Set the confirmation height on a preschool kid and move it to
    /// kindergarten, refiling the height index. A record already promoted
    /// is left untouched.
    fn preschool_to_kinder(&self, kid: &KidOutput, conf_height: u32) -> Result<(), Error>;

    /// The class for `height`: the finalized sweep tx when one was
    /// recorded at exactly `height`, the kindergarten kids due at or
    /// below `height` that are not spoken for by a finalized tx at some
    /// other height, and the crib babies whose expiry is at or below
    /// `height`.
    fn fetch_class(
        &self,
        height: u32,
    ) -> Result<(Option<Transaction>, Vec<KidOutput>, Vec<BabyOutput>), Error>;

    /// Record the sweep transaction constructed for `height`'s class.
    /// Calling again with identical bytes is a no-op; differing bytes are
    /// rejected with [`Error::AlreadyExists`].
    fn finalize_kinder(&self, height: u32, tx: &Transaction) -> Result<(), Error>;

    /// Graduate the outputs swept by the transaction finalized at
    /// `height`, unfile them from the height index, drop the finalized
    /// record, and prune every channel whose last output has now
    /// graduated.
    fn graduate_kinder(&self, height: u32) -> Result<(), Error>;

    /// Persist the graduation watermark.
    fn graduate_height(&self, height: u32) -> Result<(), Error>;

    /// Highest height for which graduation processing completed, zero if
    /// none.
    fn last_graduated_height(&self) -> Result<u32, Error>;

    /// Highest height for which a sweep was finalized, zero if none.
    fn last_finalized_height(&self) -> Result<u32, Error>;

    /// All preschool kids, used on startup to re-register confirmation
    /// notifications.
    fn fetch_preschools(&self) -> Result<Vec<KidOutput>, Error>;

    /// Heights present in the height index at or below `height`,
    /// ascending. Drives catch-up after downtime.
    fn heights_below_or_equal(&self, height: u32) -> Result<Vec<u32>, Error>;

    /// Visit every output of a channel with its stage.
    fn for_chan_outputs(
        &self,
        chan_point: &OutPoint,
        cb: &mut dyn FnMut(Stage, NurseryRecord) -> Result<(), Error>,
    ) -> Result<(), Error>;

    /// Channels with at least one tracked output.
    fn list_channels(&self) -> Result<Vec<OutPoint>, Error>;

    /// Whether every output of the channel has graduated.
    fn is_mature_channel(&self, chan_point: &OutPoint) -> Result<bool, Error>;

    /// Drop a channel and all of its output records.
    fn remove_channel(&self, chan_point: &OutPoint) -> Result<(), Error>;
}
