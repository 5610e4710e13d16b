// kernel/src/mem/layout.rs
//
// 仮想アドレスレイアウト（ユーザ env から見た固定配置）
//
// 目的:
// - 「ユーザが syscall で触れる範囲」と「カーネルが公開する読み取り専用窓」の境界を固定しておく。
// - fork の走査範囲・例外スタック・fault handler 用の一時ページはすべてここの定数で決まる。
//
// 想定レイアウト:
//
//   USER_VPT        0xef40_0000 .. +4MiB   ページテーブルの読み取り専用ビュー（自己参照）
//   USER_TOP        0xeec0_0000            ここから上はユーザから map できない
//   USER_XSTACK_TOP 0xeec0_0000            例外スタック（1 ページ）の上端
//                   0xeebf_f000 .. top     例外スタック
//                   0xeebf_e000 .. +4KiB   空きガードページ
//   USER_STACK_TOP  0xeebf_e000            通常のユーザスタックの上端
//        ...
//   USER_TEXT       0x0080_0000            プログラムのテキスト/データ先頭
//   FAULT_TEMP      0x007f_f000            fault handler 専用の一時ページ
//   USER_TEMP       0x0040_0000            一時マッピング用の領域
//

use crate::mem::addr::{VirtAddr, PAGE_SIZE, PT_SPAN};

/// ユーザ/カーネルの境界。これ以上はユーザから map できない。
pub const USER_TOP: VirtAddr = VirtAddr(0xeec0_0000);

/// 例外スタックの上端（1 ページだけの専用スタック）。
pub const USER_XSTACK_TOP: VirtAddr = USER_TOP;

/// 例外スタックのページ先頭。
pub const USER_XSTACK: VirtAddr = VirtAddr(USER_XSTACK_TOP.0 - PAGE_SIZE);

/// 通常スタックの上端。例外スタックとの間に 1 ページの空きを置く。
pub const USER_STACK_TOP: VirtAddr = VirtAddr(USER_TOP.0 - 2 * PAGE_SIZE);

/// プログラムのテキスト領域の開始。fork はここから走査する。
pub const USER_TEXT: VirtAddr = VirtAddr(2 * PT_SPAN);

/// 一時マッピング用領域の開始。
pub const USER_TEMP: VirtAddr = VirtAddr(PT_SPAN);

/// fault handler がコピー先として使う一時ページ。
pub const FAULT_TEMP: VirtAddr = VirtAddr(USER_TEMP.0 + PT_SPAN - PAGE_SIZE);

/// ページテーブルの読み取り専用ビューが公開される位置。
pub const USER_VPT: VirtAddr = VirtAddr(0xef40_0000);
