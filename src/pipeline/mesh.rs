//! STL reading and mesh volume.
//!
//! Supports both STL encodings:
//! - ASCII files start with "solid" and contain `facet`/`vertex` records
//! - Binary files have an 80-byte header, a little-endian face count and
//!   50 bytes per triangle (normal, three vertices, attribute word)

use std::path::Path;

use anyhow::{bail, Context, Result};

/// A triangle as three vertex positions.
pub type Triangle = [[f64; 3]; 3];

const HEADER_SIZE: usize = 80;
const TRIANGLE_SIZE: usize = 50;

/// Parse STL content in either encoding.
pub fn parse_stl(bytes: &[u8]) -> Result<Vec<Triangle>> {
    if bytes.len() < 6 {
        bail!("file too small to be valid STL");
    }
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(HEADER_SIZE)]);
    if head.trim_start().starts_with("solid") && !is_binary(bytes) {
        parse_ascii(bytes)
    } else {
        parse_binary(bytes)
    }
}

/// Binary files sometimes start with "solid"; their size gives them away.
fn is_binary(bytes: &[u8]) -> bool {
    if bytes.len() < HEADER_SIZE + 4 {
        return false;
    }
    let count = u32::from_le_bytes([
        bytes[HEADER_SIZE],
        bytes[HEADER_SIZE + 1],
        bytes[HEADER_SIZE + 2],
        bytes[HEADER_SIZE + 3],
    ]) as usize;
    bytes.len() == HEADER_SIZE + 4 + count * TRIANGLE_SIZE || bytes[..HEADER_SIZE].contains(&0)
}

fn parse_binary(bytes: &[u8]) -> Result<Vec<Triangle>> {
    if bytes.len() < HEADER_SIZE + 4 {
        bail!("binary STL header truncated ({} bytes)", bytes.len());
    }
    let count = u32::from_le_bytes([
        bytes[HEADER_SIZE],
        bytes[HEADER_SIZE + 1],
        bytes[HEADER_SIZE + 2],
        bytes[HEADER_SIZE + 3],
    ]) as usize;
    let body = &bytes[HEADER_SIZE + 4..];
    if body.len() < count * TRIANGLE_SIZE {
        bail!(
            "binary STL declares {count} faces but holds {}",
            body.len() / TRIANGLE_SIZE
        );
    }
    Ok(body
        .chunks_exact(TRIANGLE_SIZE)
        .take(count)
        .map(|chunk| {
            // skip the 12-byte normal
            [
                read_vertex(&chunk[12..24]),
                read_vertex(&chunk[24..36]),
                read_vertex(&chunk[36..48]),
            ]
        })
        .collect())
}

fn read_vertex(buf: &[u8]) -> [f64; 3] {
    let coord = |i: usize| f64::from(f32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]));
    [coord(0), coord(4), coord(8)]
}

fn parse_ascii(bytes: &[u8]) -> Result<Vec<Triangle>> {
    let text = std::str::from_utf8(bytes).context("ASCII STL is not UTF-8")?;
    let mut triangles = Vec::new();
    let mut vertices: Vec<[f64; 3]> = Vec::with_capacity(3);

    for (line_no, line) in text.lines().enumerate() {
        let mut parts = line.split_whitespace();
        match parts.next().map(str::to_ascii_lowercase).as_deref() {
            Some("outer") => vertices.clear(),
            Some("vertex") => {
                let mut coord = [0.0; 3];
                for value in &mut coord {
                    let token = parts
                        .next()
                        .with_context(|| format!("line {}: vertex needs 3 coordinates", line_no + 1))?;
                    *value = token
                        .parse()
                        .with_context(|| format!("line {}: bad coordinate '{token}'", line_no + 1))?;
                }
                vertices.push(coord);
            }
            Some("endfacet") => {
                if let [a, b, c] = vertices[..] {
                    triangles.push([a, b, c]);
                }
                vertices.clear();
            }
            Some("endsolid") => break,
            _ => {}
        }
    }
    Ok(triangles)
}

/// Signed volume enclosed by a closed triangle mesh.
///
/// Positive for outward-facing normals, negative for an inside-out mesh.
pub fn signed_volume(triangles: &[Triangle]) -> f64 {
    triangles
        .iter()
        .map(|[v0, v1, v2]| {
            let cross = [
                v1[1].mul_add(v2[2], -(v1[2] * v2[1])),
                v1[2].mul_add(v2[0], -(v1[0] * v2[2])),
                v1[0].mul_add(v2[1], -(v1[1] * v2[0])),
            ];
            v0[2].mul_add(cross[2], v0[0].mul_add(cross[0], v0[1] * cross[1]))
        })
        .sum::<f64>()
        / 6.0
}

/// Read an STL file and return its signed volume.
pub async fn stl_signed_volume(path: &Path) -> Result<f64> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let triangles = parse_stl(&bytes).with_context(|| format!("parsing {}", path.display()))?;
    if triangles.is_empty() {
        bail!("{} contains no triangles", path.display());
    }
    Ok(signed_volume(&triangles))
}

/// Write triangles as ASCII STL.
pub fn to_ascii_stl(name: &str, triangles: &[Triangle]) -> String {
    let mut out = format!("solid {name}\n");
    for triangle in triangles {
        out.push_str("  facet normal 0 0 0\n    outer loop\n");
        for [x, y, z] in triangle {
            out.push_str(&format!("      vertex {x} {y} {z}\n"));
        }
        out.push_str("    endloop\n  endfacet\n");
    }
    out.push_str(&format!("endsolid {name}\n"));
    out
}

/// Closed axis-aligned box scaled so its signed volume equals `volume`.
/// A negative volume produces an inside-out box.
pub fn box_with_volume(volume: f64) -> Vec<Triangle> {
    let side = volume.abs().cbrt();
    let p = |x: f64, y: f64, z: f64| [x * side, y * side, z * side];
    let corners = [
        p(0.0, 0.0, 0.0),
        p(1.0, 0.0, 0.0),
        p(1.0, 1.0, 0.0),
        p(0.0, 1.0, 0.0),
        p(0.0, 0.0, 1.0),
        p(1.0, 0.0, 1.0),
        p(1.0, 1.0, 1.0),
        p(0.0, 1.0, 1.0),
    ];
    // outward winding
    let faces: [[usize; 3]; 12] = [
        [0, 2, 1],
        [0, 3, 2],
        [4, 5, 6],
        [4, 6, 7],
        [0, 1, 5],
        [0, 5, 4],
        [2, 3, 7],
        [2, 7, 6],
        [1, 2, 6],
        [1, 6, 5],
        [0, 4, 7],
        [0, 7, 3],
    ];
    faces
        .iter()
        .map(|&[a, b, c]| {
            if volume < 0.0 {
                [corners[a], corners[c], corners[b]]
            } else {
                [corners[a], corners[b], corners[c]]
            }
        })
        .collect()
}
