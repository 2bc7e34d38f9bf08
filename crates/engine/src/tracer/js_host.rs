// tracefork - Transaction Replay and Path Forensics
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! In-process host for the JavaScript tracers
//!
//! Evaluates a tracer object the way a node would and drives it with a
//! scripted sequence of steps and frame events. The host provides the
//! node-side globals (`toHex`, `toAddress`, `toWord`), an in-memory state
//! database and builders for step logs and call frames:
//!
//! - `step(op, depth, pc, contract, stack)` with the stack listed bottom first
//! - `enter(from, to, value, input)` and `exit(error)`
//! - `finish(gasUsed, error)` returns the tracer result as JSON text
//!
//! Stack items and balances are `BigInt`s, addresses and words lower-case hex.

use boa_engine::{Context, Source};
use serde_json::Value;

const HOST: &str = r#"
var ZERO_WORD = "0x0000000000000000000000000000000000000000000000000000000000000000";

function toHex(v) { return typeof v === "string" ? v : "0x" + v.toString(16); }
function toAddress(v) { return v; }
function toWord(v) { return v; }

function pad(n) {
    var h = BigInt(n).toString(16);
    while (h.length < 64) h = "0" + h;
    return "0x" + h;
}

var db = {
    balances: {},
    storage: {},
    getBalance: function (a) {
        return this.balances[a] === undefined ? BigInt(0) : this.balances[a];
    },
    getState: function (a, slot) {
        var s = this.storage[a];
        return s && s[slot] ? s[slot] : ZERO_WORD;
    }
};

function contract(address, caller, value, input) {
    return {
        getAddress: function () { return address; },
        getCaller: function () { return caller; },
        getValue: function () { return value; },
        getInput: function () { return input; }
    };
}

function step(op, depth, pc, code, stack) {
    var items = (stack || []).map(function (v) { return BigInt(v); });
    tracer.step({
        op: { toString: function () { return op; } },
        getDepth: function () { return depth; },
        getPC: function () { return pc; },
        contract: code,
        stack: { peek: function (n) { return items[items.length - 1 - n]; } },
        memory: { slice: function (from, to) { return "0x"; } }
    }, db);
}

function enter(from, to, value, input) {
    tracer.enter({
        getFrom: function () { return from; },
        getTo: function () { return to; },
        getValue: function () { return value; },
        getInput: function () { return input; }
    });
}

function exit(error) {
    tracer.exit({
        getError: function () { return error; },
        getGasUsed: function () { return 0; },
        getOutput: function () { return "0x"; }
    });
}

function finish(gasUsed, error) {
    return JSON.stringify(tracer.result({ gasUsed: gasUsed, output: "0x", error: error }, db));
}
"#;

/// Run `driver` against the tracer built from `source` and parse its result
///
/// `driver` is a function body that ends by returning `finish(..)`.
pub(crate) fn run(source: &str, driver: &str) -> Value {
    let program = format!("{HOST}\nvar tracer = ({source});\n(function () {{\n{driver}\n}})();");
    let mut context = Context::default();
    let output = context
        .eval(Source::from_bytes(program.as_bytes()))
        .unwrap_or_else(|err| panic!("tracer script failed: {err:?}"));
    let text = output
        .to_string(&mut context)
        .unwrap_or_else(|err| panic!("tracer result is not text: {err:?}"))
        .to_std_string_escaped();
    serde_json::from_str(&text).unwrap_or_else(|err| panic!("tracer result is not JSON ({err}): {text}"))
}
