//! Fixed JavaScript text emitted around the bundled modules.

pub(crate) const HEADER: &str = "\"use strict\";\n(function() {\n";

pub(crate) const FOOTER: &str = "})();\n";

/// Every chunk registers its modules into one registry shared by the page.
pub(crate) const REGISTRY: &str =
    "var modules = (globalThis.__modules__ = globalThis.__modules__ || {});\n";

/// Module loader, only emitted into entrypoint chunks.
///
/// A module is cached before its body runs, so a cycle observes the partial
/// `exports` of the module that started it instead of recursing forever.
pub(crate) const RUNTIME: &str = r#"var cache = {};

function require(name) {
  if (cache[name]) {
    return cache[name].exports;
  }
  if (!modules[name]) {
    throw new Error("Cannot find module '" + name + "'");
  }
  var module = {
    name: name,
    exports: {}
  };
  cache[name] = module;
  modules[name](module, module.exports, require);
  return module.exports;
}

function chunk(path, cb) {
  var script = document.createElement("script");
  script.src = path;
  script.type = "text/javascript";
  script.onload = function() { cb(); };
  document.getElementsByTagName("head")[0].appendChild(script);
}

function start(chunks, main) {
  var loaded = 0;
  if (!chunks || chunks.length === 0) {
    require(main);
    return;
  }
  chunks.forEach(function(path) {
    chunk(path, function() {
      loaded++;
      if (loaded === chunks.length) {
        require(main);
      }
    });
  });
}
"#;
