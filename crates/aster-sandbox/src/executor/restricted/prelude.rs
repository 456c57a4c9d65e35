//! 受限解释器的初始化脚本
//!
//! 在用户代码之前执行：捕获宿主输出函数，删除白名单之外的全局对象，
//! 封堵函数构造器路径，然后以只读属性安装内置辅助函数与模块加载器。

use std::collections::BTreeSet;

/// 宿主注册的 stdout 写入函数，初始化后从全局删除
pub(crate) const WRITE_OUT: &str = "__aster_write_out";
/// 宿主注册的 stderr 写入函数
pub(crate) const WRITE_ERR: &str = "__aster_write_err";

/// 可通过导入获得的安全模块
pub const SAFE_MODULES: &[&str] = &["math", "json", "random", "statistics", "datetime", "re"];

const ALLOWED_PLACEHOLDER: &str = "__ASTER_ALLOWED_IMPORTS__";

const PRELUDE: &str = r#"
(function (writeOut, writeErr, allowed) {
  "use strict";
  const G = globalThis;

  const KEEP = new Set([
    "Object", "Array", "String", "Number", "Boolean", "Math", "JSON", "Map", "Set",
    "WeakMap", "WeakSet", "Date", "RegExp", "Symbol", "BigInt", "Promise",
    "Error", "TypeError", "RangeError", "SyntaxError", "ReferenceError", "EvalError",
    "URIError", "AggregateError", "parseInt", "parseFloat", "isNaN", "isFinite",
    "NaN", "Infinity", "undefined", "globalThis", "encodeURIComponent",
    "decodeURIComponent", "encodeURI", "decodeURI", "ArrayBuffer", "DataView",
    "Int8Array", "Uint8Array", "Uint8ClampedArray", "Int16Array", "Uint16Array",
    "Int32Array", "Uint32Array", "Float32Array", "Float64Array", "BigInt64Array",
    "BigUint64Array",
  ]);

  const functionPrototypes = [
    Object.getPrototypeOf(function () {}),
    Object.getPrototypeOf(function* () {}),
    Object.getPrototypeOf(async function () {}),
    Object.getPrototypeOf(async function* () {}),
  ];
  for (const proto of functionPrototypes) {
    try {
      Object.defineProperty(proto, "constructor", {
        value: undefined, writable: false, enumerable: false, configurable: false,
      });
    } catch (e) {}
  }

  for (const name of Object.getOwnPropertyNames(G)) {
    if (!KEEP.has(name)) {
      try { delete G[name]; } catch (e) {}
    }
  }

  const show = (value) => {
    if (typeof value === "string") return value;
    if (value === undefined) return "undefined";
    if (typeof value === "function") return "[Function]";
    if (typeof value === "symbol") return value.toString();
    if (value !== null && typeof value === "object" && !(value instanceof Error)) {
      try {
        const text = JSON.stringify(value);
        if (text !== undefined) return text;
      } catch (e) {}
    }
    return String(value);
  };
  const line = (args) => args.map(show).join(" ") + "\n";

  const toList = (value) => {
    if (value === null || value === undefined) throw new TypeError("object is not iterable");
    if (value instanceof Map) return Array.from(value.keys());
    if (typeof value === "string" || typeof value[Symbol.iterator] === "function") {
      return Array.from(value);
    }
    if (typeof value === "object") return Object.keys(value);
    throw new TypeError("object is not iterable");
  };
  const pick = (args, better) => {
    const items = args.length === 1 ? toList(args[0]) : args;
    if (items.length === 0) throw new RangeError("arg is an empty sequence");
    return items.reduce((a, b) => (better(b, a) ? b : a));
  };

  const helpers = {
    print: (...args) => { writeOut(line(args)); },
    len: (value) => {
      if (value === null || value === undefined) throw new TypeError("object has no len()");
      if (value instanceof Map || value instanceof Set) return value.size;
      if (typeof value === "string" || typeof value.length === "number") return value.length;
      if (typeof value === "object") return Object.keys(value).length;
      throw new TypeError("object has no len()");
    },
    min: (...args) => pick(args, (a, b) => a < b),
    max: (...args) => pick(args, (a, b) => a > b),
    sum: (value, start = 0) => toList(value).reduce((a, b) => a + b, start),
    abs: (x) => Math.abs(x),
    round: (x, digits = 0) => {
      const factor = 10 ** digits;
      return Math.round(x * factor) / factor;
    },
    sorted: (value, options) => {
      const key = typeof options === "function" ? options : (options && options.key) || ((v) => v);
      const items = toList(value).slice();
      items.sort((a, b) => {
        const ka = key(a);
        const kb = key(b);
        return ka < kb ? -1 : ka > kb ? 1 : 0;
      });
      if (options && options.reverse) items.reverse();
      return items;
    },
    reversed: (value) => toList(value).slice().reverse(),
    range: (start, stop, step = 1) => {
      if (stop === undefined) {
        stop = start;
        start = 0;
      }
      if (step === 0) throw new RangeError("range() arg 3 must not be zero");
      const out = [];
      if (step > 0) {
        for (let i = start; i < stop; i += step) out.push(i);
      } else {
        for (let i = start; i > stop; i += step) out.push(i);
      }
      return out;
    },
    enumerate: (value, start = 0) => toList(value).map((v, i) => [i + start, v]),
    zip: (...values) => {
      const lists = values.map(toList);
      const n = lists.length === 0 ? 0 : Math.min(...lists.map((l) => l.length));
      return Array.from({ length: n }, (_, i) => lists.map((l) => l[i]));
    },
    any: (value) => toList(value).some(Boolean),
    all: (value) => toList(value).every(Boolean),
    str: (value) => (value === undefined ? "" : show(value)),
    int: (value, base) => {
      const n = base !== undefined
        ? parseInt(String(value).trim(), base)
        : typeof value === "string" ? parseInt(value.trim(), 10) : Math.trunc(Number(value));
      if (Number.isNaN(n)) throw new TypeError("invalid literal for int(): " + show(value));
      return n;
    },
    float: (value) => {
      const n = Number(typeof value === "string" ? value.trim() : value);
      if (Number.isNaN(n) && !(typeof value === "string" && value.trim().toLowerCase() === "nan")) {
        throw new TypeError("could not convert to float: " + show(value));
      }
      return n;
    },
    bool: (value) => (Array.isArray(value) ? value.length > 0 : Boolean(value)),
    list: (value) => (value === undefined ? [] : toList(value).slice()),
    format: (value, ...rest) => {
      if (typeof value === "string" && rest.length > 0 && /\{\d*\}/.test(value)) {
        let next = 0;
        return value.replace(/\{(\d*)\}/g, (_, index) =>
          show(index === "" ? rest[next++] : rest[Number(index)]));
      }
      const spec = rest[0];
      if (spec === undefined || spec === "") return show(value);
      const fixed = /^\.(\d+)f$/.exec(spec);
      if (fixed) return Number(value).toFixed(Number(fixed[1]));
      if (spec === "d") return String(Math.trunc(value));
      if (spec === "%") return (Number(value) * 100).toFixed(0) + "%";
      return show(value);
    },
  };
  helpers.console = Object.freeze({
    log: helpers.print,
    info: helpers.print,
    debug: helpers.print,
    warn: (...args) => { writeErr(line(args)); },
    error: (...args) => { writeErr(line(args)); },
  });

  const numbers = (data) => {
    const items = toList(data).map(Number);
    if (items.length === 0) throw new RangeError("requires at least one data point");
    return items;
  };
  const mean = (data) => {
    const items = numbers(data);
    return items.reduce((a, b) => a + b, 0) / items.length;
  };
  const variance = (data, sample) => {
    const items = numbers(data);
    if (sample && items.length < 2) throw new RangeError("variance requires at least two data points");
    const m = mean(items);
    const squares = items.reduce((acc, x) => acc + (x - m) ** 2, 0);
    return squares / (sample ? items.length - 1 : items.length);
  };

  const math = {};
  for (const name of Object.getOwnPropertyNames(Math)) math[name] = Math[name];
  Object.assign(math, {
    pi: Math.PI,
    e: Math.E,
    tau: 2 * Math.PI,
    inf: Infinity,
    nan: NaN,
    fabs: Math.abs,
    isfinite: (x) => Number.isFinite(x),
    isnan: (x) => Number.isNaN(x),
    isclose: (a, b, relTol = 1e-9, absTol = 0) =>
      Math.abs(a - b) <= Math.max(relTol * Math.max(Math.abs(a), Math.abs(b)), absTol),
    factorial: (n) => {
      if (!Number.isInteger(n) || n < 0) throw new RangeError("factorial() not defined for " + show(n));
      let out = 1;
      for (let i = 2; i <= n; i++) out *= i;
      return out;
    },
    gcd: (a, b) => {
      a = Math.abs(a);
      b = Math.abs(b);
      while (b) [a, b] = [b, a % b];
      return a;
    },
  });

  const modules = {
    math,
    json: {
      dumps: (value, indent) => JSON.stringify(value, null, indent),
      loads: (text) => JSON.parse(text),
      stringify: JSON.stringify,
      parse: JSON.parse,
    },
    random: {
      random: () => Math.random(),
      uniform: (a, b) => a + (b - a) * Math.random(),
      randint: (a, b) => a + Math.floor(Math.random() * (b - a + 1)),
      choice: (seq) => {
        const items = toList(seq);
        if (items.length === 0) throw new RangeError("cannot choose from an empty sequence");
        return items[Math.floor(Math.random() * items.length)];
      },
      shuffle: (items) => {
        for (let i = items.length - 1; i > 0; i--) {
          const j = Math.floor(Math.random() * (i + 1));
          [items[i], items[j]] = [items[j], items[i]];
        }
        return items;
      },
    },
    statistics: {
      mean,
      fmean: mean,
      median: (data) => {
        const items = numbers(data).sort((a, b) => a - b);
        const mid = Math.floor(items.length / 2);
        return items.length % 2 ? items[mid] : (items[mid - 1] + items[mid]) / 2;
      },
      mode: (data) => {
        const counts = new Map();
        let best;
        let bestCount = 0;
        for (const x of toList(data)) {
          const c = (counts.get(x) || 0) + 1;
          counts.set(x, c);
          if (c > bestCount) {
            best = x;
            bestCount = c;
          }
        }
        if (bestCount === 0) throw new RangeError("no mode for empty data");
        return best;
      },
      variance: (data) => variance(data, true),
      pvariance: (data) => variance(data, false),
      stdev: (data) => Math.sqrt(variance(data, true)),
      pstdev: (data) => Math.sqrt(variance(data, false)),
    },
    datetime: {
      now: () => new Date(),
      today: () => {
        const d = new Date();
        return new Date(d.getFullYear(), d.getMonth(), d.getDate());
      },
      fromisoformat: (text) => new Date(text),
      fromtimestamp: (seconds) => new Date(seconds * 1000),
    },
    re: {
      compile: (pattern, flags) => new RegExp(pattern, flags),
      search: (pattern, text) => new RegExp(pattern).exec(text),
      match: (pattern, text) => new RegExp("^(?:" + pattern + ")").exec(text),
      fullmatch: (pattern, text) => new RegExp("^(?:" + pattern + ")$").exec(text),
      findall: (pattern, text) =>
        Array.from(String(text).matchAll(new RegExp(pattern, "g")), (m) => (m.length > 1 ? m[1] : m[0])),
      sub: (pattern, replacement, text) => String(text).replace(new RegExp(pattern, "g"), replacement),
      split: (pattern, text) => String(text).split(new RegExp(pattern)),
    },
  };
  for (const name of Object.keys(modules)) Object.freeze(modules[name]);

  const allowedSet = new Set(allowed);
  const isAllowed = (name) =>
    allowedSet.has(name) || (name.includes(".") && allowedSet.has(name.split(".")[0]));

  helpers.__module = (name) => {
    name = String(name);
    if (!isAllowed(name)) throw new Error("Import not allowed: " + name);
    if (!Object.prototype.hasOwnProperty.call(modules, name)) {
      throw new Error("Module not found: " + name);
    }
    return modules[name];
  };

  // 已存在的全局名称保持不变，只补充新名称
  helpers.__import_star = (mod) => {
    for (const key of Object.keys(mod)) {
      if (!(key in G)) G[key] = mod[key];
    }
  };

  for (const name of Object.keys(helpers)) {
    Object.defineProperty(G, name, {
      value: helpers[name], writable: false, enumerable: false, configurable: false,
    });
  }
})(__aster_write_out, __aster_write_err, __ASTER_ALLOWED_IMPORTS__);
"#;

/// 生成注入了导入白名单的初始化脚本
pub(crate) fn build(allowed_imports: &BTreeSet<String>) -> String {
    let allowed = serde_json::to_string(allowed_imports).unwrap_or_else(|_| "[]".to_string());
    PRELUDE.replace(ALLOWED_PLACEHOLDER, &allowed)
}
