// kernel/src/mem/paging.rs

use core::fmt;

use crate::mem::addr::{PhysFrame, VirtPage, PAGE_SHIFT, PAGE_SIZE};

bitflags::bitflags! {
    /// ページ属性
    ///
    /// - PRESENT: ページが有効
    /// - WRITABLE: 書き込み可能
    /// - USER: ユーザ空間からアクセス可能
    /// - SHARE: 明示共有ページ（fork でも COW にせず同一ページをそのまま共有する）
    /// - COW: copy-on-write（書き込み時に fault handler が私有コピーを作る）
    ///
    /// SHARE / COW はハードウェアが無視する「ソフトウェア用ビット」(9..11) に置く。
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PteFlags: u64 {
        /// ページが有効かどうか
        const PRESENT = 1 << 0;
        /// 書き込み可能かどうか
        const WRITABLE = 1 << 1;
        /// ユーザ空間からアクセス可能かどうか
        const USER = 1 << 2;
        /// 明示共有
        const SHARE = 1 << 10;
        /// copy-on-write
        const COW = 1 << 11;
    }
}

impl PteFlags {
    /// ソフトウェアが自由に使えるビット（9..11）
    pub const AVAIL: PteFlags = PteFlags::from_bits_retain(0xe00);

    /// syscall でユーザが指定してよいビットの全体
    pub const SYSCALL: PteFlags = PteFlags::from_bits_retain(
        Self::AVAIL.bits() | Self::PRESENT.bits() | Self::WRITABLE.bits() | Self::USER.bits(),
    );

    /// ユーザが syscall で map するときの最低条件
    pub const USER_PRESENT: PteFlags =
        PteFlags::from_bits_retain(Self::PRESENT.bits() | Self::USER.bits());
}

/// ページテーブルの 1 エントリ（フレーム番号 + 属性ビット）
///
/// 読み取り専用ビュー（vpd / vpt）が返すのもこの形。
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Pte(pub u64);

impl Pte {
    pub const fn empty() -> Self {
        Pte(0)
    }

    pub fn new(frame: PhysFrame, flags: PteFlags) -> Self {
        Pte((frame.number << PAGE_SHIFT) | (flags.bits() & (PAGE_SIZE - 1)))
    }

    /// 属性ビット（下位 12bit）
    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_retain(self.0 & (PAGE_SIZE - 1))
    }

    pub fn frame(self) -> PhysFrame {
        PhysFrame::from_index(self.0 >> PAGE_SHIFT)
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }
}

impl fmt::Debug for Pte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_present() {
            return write!(f, "Pte(absent, {:#x})", self.0);
        }
        write!(f, "Pte({:?}, {:?})", self.frame(), self.flags())
    }
}

/// ページ単位のメモリ操作を表現する抽象イベント。
///
/// - Map: 「この仮想ページを、この物理フレームに、この属性でマップしたい」
///   （既存マッピングがあれば置き換える）
/// - Unmap: 「この仮想ページのマッピングを解除したい」
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemAction {
    Map {
        page: VirtPage,
        frame: PhysFrame,
        flags: PteFlags,
    },
    Unmap {
        page: VirtPage,
    },
}
