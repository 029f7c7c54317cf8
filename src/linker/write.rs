use std::fs::{self, File};
use std::io::{BufWriter, Write};

use camino::Utf8Path;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use tracing::debug;

use crate::linker::runtime::{FOOTER, HEADER, REGISTRY, RUNTIME};
use crate::linker::{Bundle, Chunk, LinkError, MANIFEST, Manifest};

impl Bundle {
    /// Writes every chunk into `dir`, followed by the manifest.
    ///
    /// Chunks already written stay on disk when a later one fails.
    pub fn write(&self, dir: &Utf8Path) -> Result<Manifest, LinkError> {
        fs::create_dir_all(dir).map_err(|source| LinkError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        self.chunks
            .par_iter()
            .map(|chunk| self.write_chunk(dir, chunk))
            .collect::<Result<Vec<_>, _>>()?;

        let manifest = Manifest::from_chunks(&self.chunks);
        manifest.save(&dir.join(MANIFEST))?;

        Ok(manifest)
    }

    fn write_chunk(&self, dir: &Utf8Path, chunk: &Chunk) -> Result<(), LinkError> {
        let path = dir.join(chunk.file_name());
        let out = |source: std::io::Error| LinkError::Io {
            path: path.clone(),
            source,
        };

        let mut w = BufWriter::new(File::create(&path).map_err(out)?);

        w.write_all(HEADER.as_bytes()).map_err(out)?;
        w.write_all(REGISTRY.as_bytes()).map_err(out)?;

        if chunk.entrypoint.is_some() {
            w.write_all(RUNTIME.as_bytes()).map_err(out)?;
        }

        for module in chunk.files.keys() {
            let source = fs::read(self.root.join(module)).map_err(|source| LinkError::Io {
                path: module.clone(),
                source,
            })?;

            let key = serde_json::to_string(module.as_str())?;
            writeln!(w, "modules[{key}] = function(module, exports, require) {{").map_err(out)?;
            w.write_all(&source).map_err(out)?;
            if !source.ends_with(b"\n") {
                w.write_all(b"\n").map_err(out)?;
            }
            w.write_all(b"};\n").map_err(out)?;
        }

        if let Some(entry) = &chunk.entrypoint {
            let loads = serde_json::to_string(&chunk.loads)?;
            let main = serde_json::to_string(entry.module.as_str())?;
            writeln!(w, "start({loads}, {main});").map_err(out)?;
        }

        w.write_all(FOOTER.as_bytes()).map_err(out)?;
        w.flush().map_err(out)?;

        debug!(file = %path, modules = chunk.files.len(), "wrote chunk");
        Ok(())
    }
}
