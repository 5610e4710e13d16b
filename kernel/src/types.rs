/*!
 * types
 *
 * 役割:
 *   - カーネルとユーザライブラリで共有する素朴な型を集約する。
 *
 * やること:
 *   - env 識別子、env の実行状態。
 *
 * やらないこと:
 *   - アドレス型（mem::addr 側）や syscall の契約（abi 側）。
 *
 * 設計方針:
 *   - 依存を増やさず、共通の値型だけをここに寄せる。
 */

use core::fmt;

/// env（実行コンテキスト）の識別子
///
/// EnvId(0) は ABI 上 2 つの意味を持つ:
/// - syscall の引数としては「呼び出し元自身」
/// - sys_exofork の戻り値としては「自分は子である」
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EnvId(pub u32);

impl EnvId {
    /// 呼び出し元自身 / 子側の exofork 戻り値
    pub const SELF: EnvId = EnvId(0);

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvId({:#x})", self.0)
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvStatus {
    /// スケジューラが選んでよい
    Runnable,
    /// いま CPU 上にいる
    Running,
    /// 作成途中など、まだ走らせてはいけない
    NotRunnable,
    /// 破棄済み
    Dying,
}

impl fmt::Display for EnvStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvStatus::Runnable => write!(f, "Runnable"),
            EnvStatus::Running => write!(f, "Running"),
            EnvStatus::NotRunnable => write!(f, "NotRunnable"),
            EnvStatus::Dying => write!(f, "Dying"),
        }
    }
}
