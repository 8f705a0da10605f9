use std::{fs, io::Write, path::Path};

use candle_core::{DType, Device, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};

pub fn format_markdown_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut table = String::new();
    table.push_str("| ");
    table.push_str(&headers.join(" | "));
    table.push_str(" |\n| ");
    table.push_str(&headers.iter().map(|_| "---").collect::<Vec<_>>().join(" | "));
    table.push_str(" |\n");
    for row in rows {
        table.push_str("| ");
        table.push_str(&row.join(" | "));
        table.push_str(" |\n");
    }
    table
}

/// Replace (or append) the marked section of the results file.
pub fn update_results(section: &str, content: &str) -> std::io::Result<()> {
    let section_upper = section.to_uppercase();
    let start_marker = format!("<!-- {section_upper}_START -->");
    let end_marker = format!("<!-- {section_upper}_END -->");

    let path = Path::new("crates/attention/benchmarks/RESULTS.md");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut body = if path.exists() {
        fs::read_to_string(path)?
    } else {
        "# Attention Kernel Conformance\n\n".to_string()
    };

    let section_block = format!("{start_marker}\n{content}\n{end_marker}\n");
    if let (Some(start_idx), Some(end_idx)) = (body.find(&start_marker), body.find(&end_marker)) {
        body.replace_range(start_idx..end_idx + end_marker.len(), &section_block);
    } else {
        if !body.ends_with('\n') {
            body.push('\n');
        }
        body.push_str(&section_block);
    }

    let mut file = fs::File::create(path)?;
    file.write_all(body.as_bytes())?;
    Ok(())
}

/// Uniform `[-1, 1)` tensor from a seeded generator.
pub fn seeded_tensor(
    rng: &mut StdRng,
    dims: &[usize],
    dtype: DType,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let count: usize = dims.iter().product();
    let data: Vec<f32> = (0..count).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    Tensor::from_vec(data, dims, device)?.to_dtype(dtype)
}

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}
