/*
* Licensed to Elasticsearch B.V. under one or more contributor
* license agreements. See the NOTICE file distributed with
* this work for additional information regarding copyright
* ownership. Elasticsearch B.V. licenses this file to you under
* the Apache License, Version 2.0 (the "License"); you may
* not use this file except in compliance with the License.
* You may obtain a copy of the License at
*
*  http://www.apache.org/licenses/LICENSE-2.0
*
* Unless required by applicable law or agreed to in writing,
* software distributed under the License is distributed on an
* "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
* KIND, either express or implied.  See the License for the
* specific language governing permissions and limitations
* under the License.
*/

//! Writers for the plain-text result files a batch run leaves behind.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::errors::ScanResult;
use crate::Point;

/// Writes one track per line as a comma-separated sequence of `(x,y)` tuples.
///
/// The file is created or truncated. Parent directories must already exist.
pub fn write_track_file<P: AsRef<Path>>(path: P, tracks: &[Vec<Point>]) -> ScanResult<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    for track in tracks {
        let mut first = true;
        for position in track {
            if !first {
                write!(writer, ",")?;
            }
            write!(writer, "({:.3e},{:.3e})", position[0], position[1])?;
            first = false;
        }
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::read_to_string;
    use tempdir::TempDir;

    #[test]
    fn one_line_per_track() {
        let dir = TempDir::new("trackfile").unwrap();
        let path = dir.path().join("tracks.txt");
        let tracks = vec![
            vec![Point::new(0.0, 0.0), Point::new(10.0, 0.0)],
            vec![Point::new(-5.0, 2.5)],
        ];
        write_track_file(&path, &tracks).unwrap();
        let content = read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].matches('(').count(), 2);
        assert_eq!(lines[1].matches('(').count(), 1);
        assert!(lines[0].contains(','));
    }

    #[test]
    fn empty_track_list_writes_empty_file() {
        let dir = TempDir::new("trackfile").unwrap();
        let path = dir.path().join("empty.txt");
        write_track_file(&path, &[]).unwrap();
        assert_eq!(read_to_string(&path).unwrap(), "");
    }
}
