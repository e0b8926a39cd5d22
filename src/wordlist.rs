//! Mnemonic transfer-name generation.
//!
//! Names are three short lowercase words joined by hyphens, one adjective
//! and two nouns, e.g. `brave-otter-lime`. They are easy to read over a
//! phone call and double as the low-entropy PAKE password, so the pool only
//! needs to resist online guessing against the relay, not offline attack.

use rand::seq::SliceRandom;

const ADJECTIVES: &[&str] = &[
    "able", "amber", "bold", "brave", "brisk", "calm", "clever", "crisp", "daring", "deep",
    "eager", "early", "fancy", "fleet", "fond", "free", "gentle", "glad", "grand", "happy",
    "humble", "jolly", "keen", "kind", "late", "lively", "loyal", "lucky", "merry", "mild",
    "noble", "plain", "proud", "quick", "quiet", "rapid", "shy", "silent", "smooth", "snug",
    "solid", "stout", "sunny", "swift", "tidy", "vivid", "warm", "wise",
];

const NOUNS: &[&str] = &[
    "acorn", "aspen", "badger", "bassoon", "beacon", "bison", "brook", "candle", "canyon",
    "cedar", "cobalt", "comet", "condor", "coral", "crane", "cricket", "dingo", "dove",
    "ember", "falcon", "fern", "finch", "fjord", "gecko", "glacier", "harbor", "hazel",
    "heron", "ibis", "jasper", "kelp", "lagoon", "lemur", "lime", "llama", "lotus", "mango",
    "maple", "marmot", "meadow", "mesa", "mole", "moose", "nectar", "newt", "olive", "orbit",
    "otter", "owl", "panda", "pebble", "pecan", "pine", "plum", "quartz", "raven", "reef",
    "robin", "sable", "sparrow", "tulip", "walnut", "willow", "wren",
];

/// Produce a fresh mnemonic transfer name.
///
/// Uniqueness is not guaranteed here; the relay rejects a sender join on a
/// name already in use and the sender simply regenerates and retries.
pub fn generate_transfer_name() -> String {
    let mut rng = rand::thread_rng();

    let adjective = ADJECTIVES.choose(&mut rng).expect("wordlist is non-empty");
    // Two distinct nouns so names never stutter like `bold-otter-otter`.
    let nouns: Vec<&&str> = NOUNS.choose_multiple(&mut rng, 2).collect();

    format!("{}-{}-{}", adjective, nouns[0], nouns[1])
}
