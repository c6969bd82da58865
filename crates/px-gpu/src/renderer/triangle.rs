//! Fixed-point span triangle rasterizer
//!
//! Edges are walked in 32.32 fixed point from the top vertex down, and color
//! and texture coordinates are interpolated with 12 fractional bits plus 12
//! bits of headroom. The left edge rounds up and the right edge is exclusive,
//! so triangles sharing an edge neither overlap nor leave a gap.

use super::shade::{shade_pixel, DrawContext};
use super::vram::Vram;
use crate::commands::PolygonVertex;
use crate::types::{truncate_vertex_position, MAX_PRIMITIVE_HEIGHT, MAX_PRIMITIVE_WIDTH, VRAM_HEIGHT_MASK};

const COORD_FBS: u32 = 12;
const COORD_POST_PADDING: u32 = 12;

#[inline]
fn make_poly_xfp(x: i32) -> i64 {
    (((x as u64) << 32).wrapping_add((1u64 << 32) - (1 << 11))) as i64
}

#[inline]
fn make_poly_xfp_step(dx: i32, dy: i32) -> i64 {
    let mut dx_ex = ((dx as u64) << 32) as i64;
    if dx_ex < 0 {
        dx_ex -= (dy - 1) as i64;
    }
    if dx_ex > 0 {
        dx_ex += (dy - 1) as i64;
    }
    dx_ex / dy as i64
}

#[inline]
fn poly_xfp_int(xfp: u64) -> i32 {
    ((xfp as i64) >> 32) as i32
}

/// Per-pixel increments of the interpolated attributes
#[derive(Debug, Default, Clone, Copy)]
struct Deltas {
    du_dx: u32,
    dv_dx: u32,
    dr_dx: u32,
    dg_dx: u32,
    db_dx: u32,
    du_dy: u32,
    dv_dy: u32,
    dr_dy: u32,
    dg_dy: u32,
    db_dy: u32,
}

/// Interpolated attributes at a point
#[derive(Debug, Default, Clone, Copy)]
struct Attributes {
    u: u32,
    v: u32,
    r: u32,
    g: u32,
    b: u32,
}

impl Attributes {
    #[inline]
    fn add_dx<const SHADING: bool, const TEXTURE: bool>(&mut self, d: &Deltas, count: i32) {
        let count = count as u32;
        if SHADING {
            self.r = self.r.wrapping_add(d.dr_dx.wrapping_mul(count));
            self.g = self.g.wrapping_add(d.dg_dx.wrapping_mul(count));
            self.b = self.b.wrapping_add(d.db_dx.wrapping_mul(count));
        }
        if TEXTURE {
            self.u = self.u.wrapping_add(d.du_dx.wrapping_mul(count));
            self.v = self.v.wrapping_add(d.dv_dx.wrapping_mul(count));
        }
    }

    #[inline]
    fn add_dy<const SHADING: bool, const TEXTURE: bool>(&mut self, d: &Deltas, count: i32) {
        let count = count as u32;
        if SHADING {
            self.r = self.r.wrapping_add(d.dr_dy.wrapping_mul(count));
            self.g = self.g.wrapping_add(d.dg_dy.wrapping_mul(count));
            self.b = self.b.wrapping_add(d.db_dy.wrapping_mul(count));
        }
        if TEXTURE {
            self.u = self.u.wrapping_add(d.du_dy.wrapping_mul(count));
            self.v = self.v.wrapping_add(d.dv_dy.wrapping_mul(count));
        }
    }

    #[inline]
    fn value(component: u32) -> u8 {
        (component >> (COORD_FBS + COORD_POST_PADDING)) as u8
    }
}

/// Attribute accessors used by the gradient setup
#[derive(Clone, Copy)]
enum Attr {
    X,
    Y,
    U,
    V,
    R,
    G,
    B,
}

#[inline]
fn attr(v: &PolygonVertex, a: Attr) -> i32 {
    match a {
        Attr::X => v.x,
        Attr::Y => v.y,
        Attr::U => v.u() as i32,
        Attr::V => v.v() as i32,
        Attr::R => v.r() as i32,
        Attr::G => v.g() as i32,
        Attr::B => v.b() as i32,
    }
}

fn calc_deltas<const SHADING: bool, const TEXTURE: bool>(
    a: &PolygonVertex,
    b: &PolygonVertex,
    c: &PolygonVertex,
) -> Option<Deltas> {
    let calcis = |p: Attr, q: Attr| -> i32 {
        ((attr(b, p) - attr(a, p)).wrapping_mul(attr(c, q) - attr(b, q)))
            .wrapping_sub((attr(c, p) - attr(b, p)).wrapping_mul(attr(b, q) - attr(a, q)))
    };

    let denom = calcis(Attr::X, Attr::Y);
    if denom == 0 {
        return None;
    }

    let delta = |n: i32| -> u32 { (n.wrapping_mul(1 << COORD_FBS).wrapping_div(denom) as u32) << COORD_POST_PADDING };

    let mut d = Deltas::default();
    if SHADING {
        d.dr_dx = delta(calcis(Attr::R, Attr::Y));
        d.dr_dy = delta(calcis(Attr::X, Attr::R));
        d.dg_dx = delta(calcis(Attr::G, Attr::Y));
        d.dg_dy = delta(calcis(Attr::X, Attr::G));
        d.db_dx = delta(calcis(Attr::B, Attr::Y));
        d.db_dy = delta(calcis(Attr::X, Attr::B));
    }
    if TEXTURE {
        d.du_dx = delta(calcis(Attr::U, Attr::Y));
        d.du_dy = delta(calcis(Attr::X, Attr::U));
        d.dv_dx = delta(calcis(Attr::V, Attr::Y));
        d.dv_dy = delta(calcis(Attr::X, Attr::V));
    }
    Some(d)
}

#[inline]
fn draw_span<const SHADING: bool, const TEXTURE: bool, const RAW: bool, const TRANSPARENCY: bool, const DITHER: bool>(
    vram: &mut Vram,
    ctx: &DrawContext,
    y: i32,
    x_start: i32,
    x_bound: i32,
    mut ig: Attributes,
    deltas: &Deltas,
) {
    if ctx.params.skips_line(y) {
        return;
    }

    let mut x_ig_adjust = x_start;
    let mut w = x_bound - x_start;
    let mut x = truncate_vertex_position(x_start);

    let left = ctx.area.left as i32;
    if x < left {
        let delta = left - x;
        x_ig_adjust += delta;
        x += delta;
        w -= delta;
    }

    let right = ctx.area.right as i32 + 1;
    if x + w > right {
        w = right - x;
    }

    if w <= 0 {
        return;
    }

    ig.add_dx::<SHADING, TEXTURE>(deltas, x_ig_adjust);
    ig.add_dy::<SHADING, TEXTURE>(deltas, y);

    let py = y as u32 & VRAM_HEIGHT_MASK;
    for _ in 0..w {
        // Flat primitives keep the core vertex color since no deltas apply
        shade_pixel::<TEXTURE, RAW, TRANSPARENCY, DITHER>(
            vram,
            ctx,
            x as u32,
            py,
            Attributes::value(ig.r),
            Attributes::value(ig.g),
            Attributes::value(ig.b),
            Attributes::value(ig.u),
            Attributes::value(ig.v),
        );

        x += 1;
        ig.add_dx::<SHADING, TEXTURE>(deltas, 1);
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct TriangleHalf {
    x_coord: [u64; 2],
    x_step: [u64; 2],
    y_coord: i32,
    y_bound: i32,
    dec_mode: bool,
}

/// Rasterize one triangle
pub fn draw_triangle<
    const SHADING: bool,
    const TEXTURE: bool,
    const RAW: bool,
    const TRANSPARENCY: bool,
    const DITHER: bool,
>(
    vram: &mut Vram,
    ctx: &DrawContext,
    v0: &PolygonVertex,
    v1: &PolygonVertex,
    v2: &PolygonVertex,
) {
    let (mut v0, mut v1, mut v2) = (v0, v1, v2);

    // Track which vertex is leftmost while sorting by y
    let core_vertex = {
        let mut cvtemp: u32 = if v1.x <= v0.x {
            if v2.x <= v1.x {
                1 << 2
            } else {
                1 << 1
            }
        } else if v2.x < v0.x {
            1 << 2
        } else {
            1 << 0
        };

        if v2.y < v1.y {
            std::mem::swap(&mut v2, &mut v1);
            cvtemp = ((cvtemp >> 1) & 0x2) | ((cvtemp << 1) & 0x4) | (cvtemp & 0x1);
        }
        if v1.y < v0.y {
            std::mem::swap(&mut v1, &mut v0);
            cvtemp = ((cvtemp >> 1) & 0x1) | ((cvtemp << 1) & 0x2) | (cvtemp & 0x4);
        }
        if v2.y < v1.y {
            std::mem::swap(&mut v2, &mut v1);
            cvtemp = ((cvtemp >> 1) & 0x2) | ((cvtemp << 1) & 0x4) | (cvtemp & 0x1);
        }

        (cvtemp >> 1) as usize
    };

    if v0.y == v2.y {
        return;
    }

    if (v2.x - v0.x).unsigned_abs() >= MAX_PRIMITIVE_WIDTH
        || (v2.x - v1.x).unsigned_abs() >= MAX_PRIMITIVE_WIDTH
        || (v1.x - v0.x).unsigned_abs() >= MAX_PRIMITIVE_WIDTH
        || (v2.y - v0.y) as u32 >= MAX_PRIMITIVE_HEIGHT
    {
        return;
    }

    let base_coord = make_poly_xfp(v0.x);
    let base_step = make_poly_xfp_step(v2.x - v0.x, v2.y - v0.y);

    let (bound_coord_us, right_facing) = if v1.y == v0.y {
        (0, v1.x > v0.x)
    } else {
        let step = make_poly_xfp_step(v1.x - v0.x, v1.y - v0.y);
        (step, step > base_step)
    };

    let bound_coord_ls = if v2.y == v1.y {
        0
    } else {
        make_poly_xfp_step(v2.x - v1.x, v2.y - v1.y)
    };

    let Some(deltas) = calc_deltas::<SHADING, TEXTURE>(v0, v1, v2) else {
        return;
    };

    let vertices = [v0, v1, v2];
    let core = vertices[core_vertex];

    let start = |c: u8| -> u32 { (((c as u32) << COORD_FBS) + (1 << (COORD_FBS - 1))) << COORD_POST_PADDING };
    let mut ig = Attributes {
        u: if TEXTURE { start(core.u()) } else { 0 },
        v: if TEXTURE { start(core.v()) } else { 0 },
        r: start(core.r()),
        g: start(core.g()),
        b: start(core.b()),
    };
    ig.add_dx::<SHADING, TEXTURE>(&deltas, -core.x);
    ig.add_dy::<SHADING, TEXTURE>(&deltas, -core.y);

    let vo = usize::from(core_vertex != 0);
    let vp = if core_vertex == 2 { 3 } else { 0 };
    let rf = usize::from(right_facing);
    let base_at = |y: i32| -> u64 { base_coord.wrapping_add((y - vertices[0].y) as i64 * base_step) as u64 };

    let mut tripart = [TriangleHalf::default(); 2];
    {
        let tp = &mut tripart[vo];
        tp.y_coord = vertices[vo].y;
        tp.y_bound = vertices[1 ^ vo].y;
        tp.x_coord[rf] = make_poly_xfp(vertices[vo].x) as u64;
        tp.x_step[rf] = bound_coord_us as u64;
        tp.x_coord[rf ^ 1] = base_at(vertices[vo].y);
        tp.x_step[rf ^ 1] = base_step as u64;
        tp.dec_mode = vo != 0;
    }
    {
        let tp = &mut tripart[vo ^ 1];
        tp.y_coord = vertices[1 ^ vp].y;
        tp.y_bound = vertices[2 ^ vp].y;
        tp.x_coord[rf] = make_poly_xfp(vertices[1 ^ vp].x) as u64;
        tp.x_step[rf] = bound_coord_ls as u64;
        tp.x_coord[rf ^ 1] = base_at(vertices[1 ^ vp].y);
        tp.x_step[rf ^ 1] = base_step as u64;
        tp.dec_mode = vp != 0;
    }

    let top = ctx.area.top as i32;
    let bottom = ctx.area.bottom as i32;

    for half in &tripart {
        let mut yi = half.y_coord;
        let yb = half.y_bound;
        let (mut lc, ls) = (half.x_coord[0], half.x_step[0]);
        let (mut rc, rs) = (half.x_coord[1], half.x_step[1]);

        if half.dec_mode {
            while yi > yb {
                yi -= 1;
                lc = lc.wrapping_sub(ls);
                rc = rc.wrapping_sub(rs);

                let y = truncate_vertex_position(yi);
                if y < top {
                    break;
                }
                if y > bottom {
                    continue;
                }

                draw_span::<SHADING, TEXTURE, RAW, TRANSPARENCY, DITHER>(
                    vram,
                    ctx,
                    yi,
                    poly_xfp_int(lc),
                    poly_xfp_int(rc),
                    ig,
                    &deltas,
                );
            }
        } else {
            while yi < yb {
                let y = truncate_vertex_position(yi);
                if y > bottom {
                    break;
                }
                if y >= top {
                    draw_span::<SHADING, TEXTURE, RAW, TRANSPARENCY, DITHER>(
                        vram,
                        ctx,
                        yi,
                        poly_xfp_int(lc),
                        poly_xfp_int(rc),
                        ig,
                        &deltas,
                    );
                }

                yi += 1;
                lc = lc.wrapping_add(ls);
                rc = rc.wrapping_add(rs);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CommandParameters, DrawModeReg, Rect, TexturePaletteReg, TextureWindow};

    fn vertex(x: i32, y: i32, color: u32) -> PolygonVertex {
        PolygonVertex {
            x,
            y,
            color,
            precise_x: x as f32,
            precise_y: y as f32,
            precise_w: 1.0,
            ..Default::default()
        }
    }

    fn ctx(area: Rect<u16>) -> DrawContext {
        DrawContext {
            area,
            draw_mode: DrawModeReg(0),
            palette: TexturePaletteReg(0),
            window: TextureWindow::default(),
            params: CommandParameters::empty(),
        }
    }

    fn count_pixels(vram: &Vram, value: u16) -> usize {
        vram.pixels().iter().filter(|&&p| p == value).count()
    }

    #[test]
    fn test_right_triangle_coverage() {
        let mut vram = Vram::new();
        let c = ctx(Rect::new(0, 0, 1023, 511));
        let (a, b, d) = (vertex(0, 0, 0xFF), vertex(4, 0, 0xFF), vertex(0, 4, 0xFF));
        draw_triangle::<false, false, false, false, false>(&mut vram, &c, &a, &b, &d);
        // Rows cover 4, 3, 2 and 1 pixels
        assert_eq!(count_pixels(&vram, 0x1F), 10);
        assert_eq!(vram.get(3, 0), 0x1F);
        assert_eq!(vram.get(4, 0), 0);
        assert_eq!(vram.get(0, 3), 0x1F);
        assert_eq!(vram.get(0, 4), 0);
    }

    #[test]
    fn test_degenerate_triangle_draws_nothing() {
        let mut vram = Vram::new();
        let c = ctx(Rect::new(0, 0, 1023, 511));
        let (a, b, d) = (vertex(0, 5, 0xFF), vertex(10, 5, 0xFF), vertex(20, 5, 0xFF));
        draw_triangle::<false, false, false, false, false>(&mut vram, &c, &a, &b, &d);
        assert_eq!(count_pixels(&vram, 0x1F), 0);
    }

    #[test]
    fn test_oversized_triangle_is_culled() {
        let mut vram = Vram::new();
        let c = ctx(Rect::new(0, 0, 1023, 511));
        let (a, b, d) = (vertex(0, 0, 0xFF), vertex(1024, 0, 0xFF), vertex(0, 10, 0xFF));
        draw_triangle::<false, false, false, false, false>(&mut vram, &c, &a, &b, &d);
        assert_eq!(count_pixels(&vram, 0x1F), 0);
    }

    #[test]
    fn test_clipped_to_drawing_area() {
        let mut vram = Vram::new();
        let c = ctx(Rect::new(2, 2, 5, 5));
        let (a, b, d) = (vertex(0, 0, 0xFF), vertex(20, 0, 0xFF), vertex(0, 20, 0xFF));
        draw_triangle::<false, false, false, false, false>(&mut vram, &c, &a, &b, &d);
        assert_eq!(count_pixels(&vram, 0x1F), 16);
        assert_eq!(vram.get(1, 2), 0);
        assert_eq!(vram.get(6, 2), 0);
    }

    #[test]
    fn test_gouraud_interpolates_color() {
        let mut vram = Vram::new();
        let c = ctx(Rect::new(0, 0, 1023, 511));
        let a = vertex(0, 0, 0x0000_00FF);
        let b = vertex(64, 0, 0x0000_0000);
        let d = vertex(0, 64, 0x0000_00FF);
        draw_triangle::<true, false, false, false, false>(&mut vram, &c, &a, &b, &d);
        let left = vram.get(0, 0) & 0x1F;
        let middle = vram.get(32, 0) & 0x1F;
        assert_eq!(left, 0x1F);
        assert!(middle > 10 && middle < 20, "middle was {}", middle);
    }
}
