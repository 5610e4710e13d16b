// kernel/src/logging/console.rs
//
// コンソール出力の最小実装。
// - init(): 出力先（sink）を登録する
// - write_str(): 文字列を送信
// - write_line(): 文字列＋改行を送信
//
// 出力先は関数ポインタ 1 つだけ。未登録なら捨てる（ホスト上のテストを静かに保つ）。

use core::fmt;
use spin::Mutex;

pub type Sink = fn(&str);

static SINK: Mutex<Option<Sink>> = Mutex::new(None);

pub fn init(sink: Sink) {
    *SINK.lock() = Some(sink);
}

pub fn detach() {
    *SINK.lock() = None;
}

pub fn write_str(s: &str) {
    // ロックを持ったまま sink を呼ばない（sink 側からの再入でデッドロックしないように）
    let sink = *SINK.lock();
    if let Some(sink) = sink {
        sink(s);
    }
}

pub fn write_line(s: &str) {
    write_str(s);
    write_str("\n");
}

pub fn write_prefixed_line(prefix: &str, msg: &str) {
    write_str(prefix);
    write_line(msg);
}

/// fmt::Write を実装しておくと、format_args! をそのまま流せる
pub struct ConsoleWriter;

impl fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_str(s);
        Ok(())
    }
}
