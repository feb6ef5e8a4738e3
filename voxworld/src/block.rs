//! Block enumeration and the two classification tables.

/// One block is a single octet of type.
pub type Block = u8;

/// Internal macro to define the block constants together with their
/// classification bits, keeping the three in sync in one place.
macro_rules! blocks {
    (
        $($name:ident / $id:literal : $invisible:literal, $permeable:literal),* $(,)?
    ) => {

        $(pub const $name: Block = $id;)*

        static INVISIBLE: [bool; 256] = {
            let mut arr = [false; 256];
            $(arr[$id as usize] = $invisible;)*
            arr
        };

        static PERMEABLE: [bool; 256] = {
            let mut arr = [false; 256];
            $(arr[$id as usize] = $permeable;)*
            arr
        };

    };
}

blocks! {
    UNUSED/0:           false, false,
    STONE/1:            false, false,
    WATER/2:            false, true,
    AIR/3:              true,  true,
    BRICK/4:            false, false,
    SOIL/5:             false, false,
    LOGS/6:             false, false,
    SAND/7:             false, false,
    TREE1/8:            false, true,   // Bush
    TREE2/9:            false, true,   // Tree
    TREE3/10:           false, true,   // Big tree
    LAMP1/11:           false, false,
    LAMP2/12:           false, false,
    COBBLESTONE/13:     false, false,
    LADDER/14:          false, false,
    HEDGE/15:           false, false,
    WINDOW/16:          false, false,
    SNOW/17:            false, false,
    BROWN_WATER/18:     false, true,
    BLACK/19:           false, false,
    CONCRETE/20:        false, false,
    WHITE_CONCRETE/21:  false, false,
    GRAVEL/22:          false, false,
    TILED_STONE/23:     false, false,
    SMALL_FOG/24:       true,  true,
    BIG_FOG/25:         true,  true,
    TREASURE/26:        false, true,
    QUEST/27:           false, true,
    TUFT/28:            false, true,
    FLOWERS/29:         false, true,
    STONE2/127:         false, false,
    TOPSOIL/128:        false, false,  // Never stored in a chunk.
    TELEPORT/129:       false, false,  // Never stored in a chunk, lives in the super chunk store.
    TEXT/251:           true,  true,   // Show a text message to anyone stepping on a linked trigger.
    DE_TRIGGER/252:     true,  true,   // The opposite of a trigger, resets activator blocks.
    SPAWN/253:          true,  true,   // Spawn a monster, activated from a trigger.
    LINK/254:           true,  true,   // Links a trigger to its activators.
    TRIGGER/255:        true,  true,   // Fires when a player passes through.
}

/// Chunk flag bit: the chunk differs from its generated original.
pub const CHF_MODIFIED: u32 = 1 << 0;

/// Chunk owner value for unowned chunks.
pub const OWNER_NONE: u32 = 0;
/// Chunk owner value for the starter region, which can never be claimed.
/// Everything at or above this value is outside the real player id space.
pub const OWNER_RESERVED: u32 = 0x8000_0000;
/// Uid of the first test player; more test players count down from here.
pub const OWNER_TEST: u32 = u32::MAX;

/// True for the ids of unowned, starter and test-player chunks, none of
/// which take part in scoring.
#[inline]
pub fn owner_is_reserved(owner: u32) -> bool {
    owner == OWNER_NONE || owner >= OWNER_RESERVED
}

/// Return true if the block is not shown to clients. Invisible blocks are
/// rewritten to air in the filtered chunk stream.
#[inline]
pub fn is_invisible(block: Block) -> bool {
    INVISIBLE[block as usize]
}

/// Return true if an entity can move through the block.
#[inline]
pub fn is_permeable(block: Block) -> bool {
    PERMEABLE[block as usize]
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn classification_tables() {
        assert!(is_invisible(AIR) && is_permeable(AIR));
        assert!(is_invisible(TRIGGER) && is_permeable(TRIGGER));
        assert!(is_invisible(LINK) && is_permeable(LINK));
        assert!(!is_invisible(WATER) && is_permeable(WATER));
        assert!(!is_invisible(STONE) && !is_permeable(STONE));
        assert!(!is_invisible(SNOW) && !is_permeable(SNOW));
        assert!(is_permeable(TREE2) && !is_invisible(TREE2));
    }

}
