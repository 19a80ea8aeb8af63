use plotter_control::sim::Segment;
use svg::{
    node::element::{path::Data, Path},
    Document,
};

const MARGIN_MM: f64 = 5.0;

/// Draws everything the simulated plotter did: pen-down segments in black,
/// pen-up travel as thin grey lines.
pub fn illustrate(segments: &[Segment]) -> Document {
    let mut min = (0.0f64, 0.0f64);
    let mut max = (0.0f64, 0.0f64);
    for p in segments.iter().flat_map(|s| [s.from, s.to]) {
        min = (min.0.min(p.x), min.1.min(p.y));
        max = (max.0.max(p.x), max.1.max(p.y));
    }

    let mut document = Document::new().set(
        "viewBox",
        (
            min.0 - MARGIN_MM,
            min.1 - MARGIN_MM,
            max.0 - min.0 + 2.0 * MARGIN_MM,
            max.1 - min.1 + 2.0 * MARGIN_MM,
        ),
    );

    for seg in segments {
        let data = Data::new()
            .move_to((seg.from.x, seg.from.y))
            .line_to((seg.to.x, seg.to.y));
        let (stroke, width) = if seg.pen_down {
            ("black", 0.5)
        } else {
            ("lightgrey", 0.1)
        };
        let line = Path::new()
            .set("fill", "none")
            .set("stroke", stroke)
            .set("stroke-width", width)
            .set("d", data);
        document = document.add(line);
    }
    document
}

#[cfg(test)]
mod tests {
    use plotter_geom::Point;

    use super::*;

    #[test]
    fn one_path_per_segment() {
        let segments = [
            Segment {
                from: Point::new(0.0, 0.0),
                to: Point::new(10.0, 0.0),
                pen_down: false,
            },
            Segment {
                from: Point::new(10.0, 0.0),
                to: Point::new(10.0, 20.0),
                pen_down: true,
            },
        ];
        let out = illustrate(&segments).to_string();
        assert_eq!(out.matches("<path").count(), 2);
        assert!(out.contains("lightgrey"));
        assert!(out.contains("black"));
        assert!(out.contains("viewBox"));
    }
}
